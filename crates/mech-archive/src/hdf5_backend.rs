//! `hdf5`-backed implementation of [`ArchiveBackend`], grounded on
//! `core-terminal`'s trait + concrete-backend + RAII-guard shape.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use hdf5::File as H5File;
use mech_types::{AttrValue, Datatype, MechError, Schema};
use ndarray::ArrayD;
use tracing::trace;

use crate::ArchiveBackend;

/// The production archive backend: one open `hdf5::File` plus the
/// element-datatype of every dataset created through this handle (needed
/// to reinterpret the raw byte buffers the arena hands us as typed arrays
/// when writing/reading hyperslabs).
pub struct Hdf5Backend {
    file: H5File,
    datatypes: Mutex<HashMap<String, Datatype>>,
}

/// RAII guard ensuring the archive is flushed even if the caller
/// early-returns or panics mid-checkpoint (mirrors `TerminalGuard`).
pub struct ArchiveGuard<'a> {
    backend: &'a Hdf5Backend,
}

impl Hdf5Backend {
    pub fn flush_guard(&self) -> ArchiveGuard<'_> {
        ArchiveGuard { backend: self }
    }

    fn remember_datatype(&self, dataset_path: &str, datatype: &Datatype) {
        self.datatypes
            .lock()
            .unwrap()
            .insert(dataset_path.to_string(), datatype.clone());
    }

    /// Returns the cached datatype from this handle's own `create_dataset`
    /// calls, falling back to introspecting the dataset's on-disk HDF5
    /// type descriptor. The fallback matters for restart (spec §4.9): the
    /// `Hdf5Backend` that reads a dataset back is a fresh handle opened by
    /// a different process invocation than the one that created it, so
    /// the in-memory cache starts empty and the archive itself — not this
    /// process's memory — must be the source of truth for a dataset's type.
    fn datatype_of(&self, dataset_path: &str) -> Result<Datatype, MechError> {
        if let Some(dt) = self.datatypes.lock().unwrap().get(dataset_path).cloned() {
            return Ok(dt);
        }
        let ds = self
            .file
            .dataset(dataset_path)
            .map_err(|e| MechError::Archive(format!("open dataset {dataset_path}: {e}")))?;
        let descriptor = ds
            .dtype()
            .map_err(|e| MechError::Archive(format!("dtype {dataset_path}: {e}")))?
            .to_descriptor()
            .map_err(|e| MechError::Archive(format!("type descriptor {dataset_path}: {e}")))?;
        let inferred = match descriptor {
            // Opaque byte blocks are how compound schemas are stored
            // (`create_dataset`'s simplification); the field list itself is
            // never consulted by write/read_hyperslab, only the discriminant.
            hdf5::types::TypeDescriptor::Integer(hdf5::types::IntSize::U1) => {
                Datatype::Compound(Vec::new())
            }
            hdf5::types::TypeDescriptor::Integer(hdf5::types::IntSize::U2) => Datatype::Short,
            hdf5::types::TypeDescriptor::Integer(hdf5::types::IntSize::U4) => Datatype::Int,
            hdf5::types::TypeDescriptor::Integer(hdf5::types::IntSize::U8) => Datatype::Long,
            hdf5::types::TypeDescriptor::Float(hdf5::types::FloatSize::U4) => Datatype::Float,
            hdf5::types::TypeDescriptor::Float(hdf5::types::FloatSize::U8) => Datatype::Double,
            other => {
                return Err(MechError::Archive(format!(
                    "dataset {dataset_path}: unsupported on-disk type {other:?} for introspection"
                )))
            }
        };
        self.remember_datatype(dataset_path, &inferred);
        Ok(inferred)
    }
}

impl ArchiveBackend for Hdf5Backend {
    fn create(path: &Path) -> Result<Self, MechError> {
        let file = H5File::create(path)
            .map_err(|e| MechError::Archive(format!("create {}: {e}", path.display())))?;
        Ok(Self {
            file,
            datatypes: Mutex::new(HashMap::new()),
        })
    }

    fn open(path: &Path) -> Result<Self, MechError> {
        let file = H5File::open_rw(path)
            .map_err(|e| MechError::Archive(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            file,
            datatypes: Mutex::new(HashMap::new()),
        })
    }

    fn create_group(&self, path: &str) -> Result<(), MechError> {
        self.file
            .create_group(path)
            .map_err(|e| MechError::Archive(format!("create_group {path}: {e}")))?;
        trace!(target: "archive", path, "create_group");
        Ok(())
    }

    fn create_dataset(&self, group: &str, schema: &Schema) -> Result<(), MechError> {
        let path = format!("{group}/{}", schema.name);
        let dims = schema.dims.clone();
        macro_rules! create_typed {
            ($ty:ty) => {
                self.file
                    .new_dataset::<$ty>()
                    .shape(dims.as_slice())
                    .create(path.as_str())
                    .map(|_| ())
            };
        }
        let result = match &schema.datatype {
            Datatype::Int => create_typed!(i32),
            Datatype::Short => create_typed!(i16),
            Datatype::Long => create_typed!(i64),
            Datatype::Float => create_typed!(f32),
            Datatype::Double => create_typed!(f64),
            // Compound fields are stored as opaque byte blocks pending a
            // full H5T_COMPOUND builder; noted as a simplification in
            // DESIGN.md.
            Datatype::Compound(_) => self
                .file
                .new_dataset::<u8>()
                .shape(
                    dims.iter()
                        .cloned()
                        .chain(std::iter::once(schema.datatype.size()))
                        .collect::<Vec<_>>(),
                )
                .create(path.as_str())
                .map(|_| ()),
        };
        result.map_err(|e| MechError::Archive(format!("create_dataset {path}: {e}")))?;
        self.remember_datatype(&path, &schema.datatype);
        trace!(target: "archive", path, "create_dataset");
        Ok(())
    }

    fn write_hyperslab(
        &self,
        dataset: &str,
        offsets: &[usize],
        dims: &[usize],
        bytes: &[u8],
    ) -> Result<(), MechError> {
        let datatype = self.datatype_of(dataset)?;
        let ds = self
            .file
            .dataset(dataset)
            .map_err(|e| MechError::Archive(format!("open dataset {dataset}: {e}")))?;
        let selection = ndarray::SliceInfo::<_, ndarray::IxDyn, ndarray::IxDyn>::try_from(
            offsets
                .iter()
                .zip(dims.iter())
                .map(|(&o, &d)| ndarray::SliceInfoElem::Slice {
                    start: o as isize,
                    end: Some((o + d) as isize),
                    step: 1,
                })
                .collect::<Vec<_>>(),
        )
        .map_err(|e| MechError::Archive(format!("build hyperslab selection: {e}")))?;

        macro_rules! write_typed {
            ($ty:ty, $from_bytes:expr) => {{
                let arr: ArrayD<$ty> =
                    ArrayD::from_shape_vec(ndarray::IxDyn(dims), bytes_to_vec(bytes, $from_bytes))
                        .map_err(|e| MechError::Archive(format!("reshape write buffer: {e}")))?;
                ds.write_slice(&arr, selection)
                    .map_err(|e| MechError::Archive(format!("write_slice {dataset}: {e}")))
            }};
        }
        match datatype {
            Datatype::Int => write_typed!(i32, |c: &[u8]| i32::from_le_bytes(c.try_into().unwrap())),
            Datatype::Short => {
                write_typed!(i16, |c: &[u8]| i16::from_le_bytes(c.try_into().unwrap()))
            }
            Datatype::Long => write_typed!(i64, |c: &[u8]| i64::from_le_bytes(c.try_into().unwrap())),
            Datatype::Float => {
                write_typed!(f32, |c: &[u8]| f32::from_le_bytes(c.try_into().unwrap()))
            }
            Datatype::Double => {
                write_typed!(f64, |c: &[u8]| f64::from_le_bytes(c.try_into().unwrap()))
            }
            Datatype::Compound(_) => {
                let arr: ArrayD<u8> = ArrayD::from_shape_vec(
                    ndarray::IxDyn(
                        &dims
                            .iter()
                            .cloned()
                            .chain(std::iter::once(bytes.len() / dims.iter().product::<usize>().max(1)))
                            .collect::<Vec<_>>(),
                    ),
                    bytes.to_vec(),
                )
                .map_err(|e| MechError::Archive(format!("reshape compound write buffer: {e}")))?;
                ds.write_slice(&arr, selection)
                    .map_err(|e| MechError::Archive(format!("write_slice {dataset}: {e}")))
            }
        }
    }

    fn read_hyperslab(
        &self,
        dataset: &str,
        offsets: &[usize],
        dims: &[usize],
        buf: &mut [u8],
    ) -> Result<(), MechError> {
        let datatype = self.datatype_of(dataset)?;
        let ds = self
            .file
            .dataset(dataset)
            .map_err(|e| MechError::Archive(format!("open dataset {dataset}: {e}")))?;
        let selection = ndarray::SliceInfo::<_, ndarray::IxDyn, ndarray::IxDyn>::try_from(
            offsets
                .iter()
                .zip(dims.iter())
                .map(|(&o, &d)| ndarray::SliceInfoElem::Slice {
                    start: o as isize,
                    end: Some((o + d) as isize),
                    step: 1,
                })
                .collect::<Vec<_>>(),
        )
        .map_err(|e| MechError::Archive(format!("build hyperslab selection: {e}")))?;

        macro_rules! read_typed {
            ($ty:ty) => {{
                let arr: ArrayD<$ty> = ds
                    .read_slice(selection)
                    .map_err(|e| MechError::Archive(format!("read_slice {dataset}: {e}")))?;
                let mut cursor = 0;
                for v in arr.iter() {
                    let le = v.to_le_bytes();
                    buf[cursor..cursor + le.len()].copy_from_slice(&le);
                    cursor += le.len();
                }
            }};
        }
        match datatype {
            Datatype::Int => read_typed!(i32),
            Datatype::Short => read_typed!(i16),
            Datatype::Long => read_typed!(i64),
            Datatype::Float => read_typed!(f32),
            Datatype::Double => read_typed!(f64),
            Datatype::Compound(_) => {
                let arr: ArrayD<u8> = ds
                    .read_slice(selection)
                    .map_err(|e| MechError::Archive(format!("read_slice {dataset}: {e}")))?;
                buf.copy_from_slice(arr.as_slice().unwrap());
            }
        }
        Ok(())
    }

    fn write_attribute(&self, target: &str, name: &str, value: &AttrValue) -> Result<(), MechError> {
        // `target` may name either a group (the pool group, the root) or a
        // dataset (`board`, spec §4.3 "board ... attributes = every config
        // option"). Groups and datasets both support attributes directly in
        // HDF5, so each branch below calls the same attribute API on its
        // own concrete handle rather than coercing one into the other.
        macro_rules! write_to {
            ($location:expr) => {{
                match value {
                    AttrValue::Int(v) => $location
                        .new_attr::<i64>()
                        .create(name)
                        .and_then(|a| a.write_scalar(v)),
                    AttrValue::Double(v) => $location
                        .new_attr::<f64>()
                        .create(name)
                        .and_then(|a| a.write_scalar(v)),
                    AttrValue::Text(v) => {
                        // Fixed-length CONFIG_LEN string attributes (spec
                        // §4.3); truncated to CONFIG_LEN before handing to
                        // the backend.
                        let mut fixed = v.clone();
                        fixed.truncate(mech_types::CONFIG_LEN);
                        let ascii = hdf5::types::VarLenAscii::from_ascii(&fixed).map_err(|e| {
                            MechError::Archive(format!("non-ascii attribute {name}: {e}"))
                        })?;
                        $location
                            .new_attr::<hdf5::types::VarLenAscii>()
                            .create(name)
                            .and_then(|a| a.write_scalar(&ascii))
                    }
                    AttrValue::IntArray(v) => $location
                        .new_attr::<i64>()
                        .shape(v.len())
                        .create(name)
                        .and_then(|a| a.write(&ndarray::Array1::from_vec(v.clone()))),
                    AttrValue::DoubleArray(v) => $location
                        .new_attr::<f64>()
                        .shape(v.len())
                        .create(name)
                        .and_then(|a| a.write(&ndarray::Array1::from_vec(v.clone()))),
                }
            }};
        }

        let result = match self.file.group(target) {
            Ok(group) => write_to!(group),
            Err(_) => {
                let dataset = self.file.dataset(target).map_err(|e| {
                    MechError::Archive(format!("locate {target} for attribute {name}: {e}"))
                })?;
                write_to!(dataset)
            }
        };
        result.map_err(|e| MechError::Archive(format!("write_attribute {target}@{name}: {e}")))?;
        trace!(target: "archive", target, name, "write_attribute");
        Ok(())
    }

    fn read_attribute(&self, target: &str, name: &str) -> Result<AttrValue, MechError> {
        let location = self
            .file
            .group(target)
            .map_err(|e| MechError::Archive(format!("locate {target} for attribute {name}: {e}")))?;
        let attr = location
            .attr(name)
            .map_err(|e| MechError::Archive(format!("open attribute {target}@{name}: {e}")))?;
        attr.read_scalar::<hdf5::types::VarLenAscii>()
            .map(|s| AttrValue::Text(s.as_str().to_string()))
            .or_else(|_| attr.read_scalar::<f64>().map(AttrValue::Double))
            .or_else(|_| attr.read_scalar::<i64>().map(AttrValue::Int))
            .map_err(|e| MechError::Archive(format!("read_attribute {target}@{name}: {e}")))
    }

    fn hard_link(&self, src: &str, dst: &str) -> Result<(), MechError> {
        self.file
            .link_hard(src, dst)
            .map_err(|e| MechError::Archive(format!("hard_link {src} -> {dst}: {e}")))?;
        trace!(target: "archive", src, dst, "hard_link");
        Ok(())
    }

    fn delete_dataset(&self, path: &str) -> Result<(), MechError> {
        self.file
            .unlink(path)
            .map_err(|e| MechError::Archive(format!("delete_dataset {path}: {e}")))?;
        self.datatypes.lock().unwrap().remove(path);
        trace!(target: "archive", path, "delete_dataset");
        Ok(())
    }
}

fn bytes_to_vec<T>(bytes: &[u8], from_bytes: impl Fn(&[u8]) -> T) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    bytes.chunks_exact(size).map(from_bytes).collect()
}

impl<'a> Drop for ArchiveGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.file.flush() {
            tracing::warn!(target: "archive", error = %e, "flush_on_drop_failed");
        }
    }
}
