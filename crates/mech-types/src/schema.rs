//! Dataset schemas and the storage-layout engine (spec §4.1).
//!
//! A [`Schema`] declares one named dataset: its rank, per-axis dims, element
//! datatype, and storage discipline. [`Schema::pool_dims`] and
//! [`Schema::task_offset`] derive the pool-wide array shape and a task's
//! write offset into it from those declarations.

use serde::{Deserialize, Serialize};

use crate::error::MechError;

/// Maximum declared rank for a schema or attribute.
pub const MAX_RANK: usize = 8;
/// Rank of the task board itself (x, y, z).
pub const TASK_BOARD_RANK: usize = 3;
/// Alignment used to pad compound datatype fields (Open Question #2: fixed at 8).
pub const COMPOUND_ALIGN: usize = 8;
/// Fixed length of a string attribute on the wire (spec §4.3 `CommitAttribute`).
pub const CONFIG_LEN: usize = 128;
/// Maximum length of one config-file line (spec §6.2).
pub const CONFIG_MAX_LINE_LENGTH: usize = 512;

/// How a per-task buffer aggregates into the pool-wide array (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageDiscipline {
    /// One array per task, written under `Tasks/task-TID/`.
    Group,
    /// `[d0*X*Y*Z, d1, ...]`, offset derived from `(x, y, z)`.
    Pm3d,
    /// `[d0*X, d1*Y, d2*Z, ...]`, offset `loc_i * d_i`.
    Board,
    /// `[d0*pool_size, d1, ...]`, offset `tid * d0`.
    List,
    /// Alias of `Board` for rank >= 3 boards.
    Texture,
}

/// Element datatype of a schema. `Compound` carries its own field table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datatype {
    Int,
    Short,
    Long,
    Float,
    Double,
    Compound(Vec<CompoundField>),
}

impl Datatype {
    /// Size in bytes of one element, including compound padding (§4.1).
    pub fn size(&self) -> usize {
        match self {
            Datatype::Int => 4,
            Datatype::Short => 2,
            Datatype::Long => 8,
            Datatype::Float => 4,
            Datatype::Double => 8,
            Datatype::Compound(fields) => {
                let mut offset = 0usize;
                for f in fields {
                    offset += f.datatype.size() + pad_compound(f.datatype.size());
                }
                offset
            }
        }
    }
}

/// A named field inside a compound datatype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundField {
    pub name: String,
    pub datatype: Box<Datatype>,
}

/// Padding needed after a field of `size` bytes so the next field starts on
/// an 8-byte (`COMPOUND_ALIGN`) boundary, per spec §4.1:
/// `pad = (size <= align) ? align - size : (align - (size mod align)) mod align`.
pub fn pad_compound(size: usize) -> usize {
    if size <= COMPOUND_ALIGN {
        COMPOUND_ALIGN - size
    } else {
        (COMPOUND_ALIGN - (size % COMPOUND_ALIGN)) % COMPOUND_ALIGN
    }
}

/// HDF-visibility of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HdfVisibility {
    None,
    Normal,
    Temp,
}

/// A declared dataset (spec §3 "Schema").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub rank: usize,
    pub dims: Vec<usize>,
    pub datatype: Datatype,
    pub storage_type: StorageDiscipline,
    /// Whether workers send this buffer back to the master (spec §4.10).
    pub sync: bool,
    pub use_hdf: HdfVisibility,
}

impl Schema {
    /// Total element count of one task's buffer (`prod(dims)`).
    pub fn elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Byte size of one task's buffer.
    pub fn storage_size(&self) -> usize {
        self.elements() * self.datatype.size()
    }

    /// Pool-wide dims for this schema given board dims `board = [x, y, z]`
    /// and `pool_size = x*y*z` (spec §4.1 table). `Group` has no pool-wide
    /// array (each task owns a whole buffer), so it returns `None`.
    pub fn pool_dims(&self, board: [usize; 3], pool_size: usize) -> Option<Vec<usize>> {
        let d = &self.dims;
        match self.storage_type {
            StorageDiscipline::Group => None,
            StorageDiscipline::Pm3d => {
                let mut v = vec![d[0] * board[0] * board[1] * board[2]];
                v.extend_from_slice(&d[1..]);
                Some(v)
            }
            StorageDiscipline::List => {
                let mut v = vec![d[0] * pool_size];
                v.extend_from_slice(&d[1..]);
                Some(v)
            }
            StorageDiscipline::Board | StorageDiscipline::Texture => {
                let mut v = Vec::with_capacity(d.len());
                for i in 0..d.len() {
                    if i < 3 {
                        v.push(d[i] * board[i]);
                    } else {
                        v.push(d[i]);
                    }
                }
                Some(v)
            }
        }
    }

    /// Per-task write offset into the pool-wide array for a task at
    /// `(x, y, z)` with id `tid` (spec §4.1 table). `Group` has no pool-wide
    /// offset (whole-buffer write), so it returns `None`.
    pub fn task_offset(
        &self,
        loc: [usize; 3],
        tid: usize,
        board: [usize; 3],
    ) -> Option<Vec<usize>> {
        let d0 = self.dims.first().copied().unwrap_or(0);
        match self.storage_type {
            StorageDiscipline::Group => None,
            StorageDiscipline::Pm3d => {
                let [x, y, z] = loc;
                let [bx, by, _] = board;
                let offset0 = (x + bx * y) * d0 + z * bx * by * d0;
                let mut v = vec![offset0];
                v.extend(std::iter::repeat(0).take(self.dims.len().saturating_sub(1)));
                Some(v)
            }
            StorageDiscipline::List => {
                let offset0 = tid * d0;
                let mut v = vec![offset0];
                v.extend(std::iter::repeat(0).take(self.dims.len().saturating_sub(1)));
                Some(v)
            }
            StorageDiscipline::Board | StorageDiscipline::Texture => {
                let mut v = Vec::with_capacity(self.dims.len());
                for i in 0..self.dims.len() {
                    if i < 3 {
                        v.push(loc[i] * self.dims[i]);
                    } else {
                        v.push(0);
                    }
                }
                Some(v)
            }
        }
    }
}

/// Validates a schema against spec §4.1's `CheckLayout` rules. Fails
/// with [`MechError::Layout`] rather than [`CORE_ERR_STORAGE`] directly;
/// callers map that via `MechError::exit_code()`.
pub fn check_layout(schema: &Schema) -> Result<(), MechError> {
    if schema.rank <= 1 {
        return Err(MechError::Layout(format!(
            "schema '{}': rank must be > 1, got {}",
            schema.name, schema.rank
        )));
    }
    if schema.rank > MAX_RANK {
        return Err(MechError::Layout(format!(
            "schema '{}': rank {} exceeds MAX_RANK {}",
            schema.name, schema.rank, MAX_RANK
        )));
    }
    if schema.dims.len() != schema.rank {
        return Err(MechError::Layout(format!(
            "schema '{}': dims length {} does not match rank {}",
            schema.name,
            schema.dims.len(),
            schema.rank
        )));
    }
    if schema.dims.iter().any(|&d| d < 1) {
        return Err(MechError::Layout(format!(
            "schema '{}': all dims must be >= 1",
            schema.name
        )));
    }
    if matches!(schema.storage_type, StorageDiscipline::Texture) && schema.rank < 3 {
        return Err(MechError::Layout(format!(
            "schema '{}': TEXTURE requires rank >= 3, got {}",
            schema.name, schema.rank
        )));
    }
    Ok(())
}

/// Applies the `use_hdf` => `sync` forcing rule from spec §4.1: when a
/// dataset is HDF-visible, synchronization is forced on. Call after
/// `check_layout` succeeds.
pub fn apply_hdf_forcing(schema: &mut Schema) {
    if schema.use_hdf != HdfVisibility::None {
        schema.sync = true;
    }
}
