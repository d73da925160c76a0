//! Buffer arena (spec §4.2): owns contiguous, zero-initialized byte buffers
//! per dataset/attribute and exposes n-D index arithmetic over
//! `storage_dim` so no per-dimension pointer tree is ever observable
//! outside the arena.

use std::collections::HashMap;

use mech_types::MechError;
use tracing::trace;

/// One contiguous, zero-initialized buffer for a pool-wide (or per-task,
/// for `Group` discipline) dataset.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub storage_dim: Vec<usize>,
    pub elem_size: usize,
    bytes: Vec<u8>,
}

impl Buffer {
    fn zeroed(storage_dim: Vec<usize>, elem_size: usize) -> Result<Self, MechError> {
        let elements: usize = storage_dim.iter().product();
        let total = elements
            .checked_mul(elem_size)
            .ok_or_else(|| MechError::Memory("buffer size overflow".into()))?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total)
            .map_err(|e| MechError::Memory(format!("allocate {total} bytes: {e}")))?;
        bytes.resize(total, 0);
        Ok(Self {
            storage_dim,
            elem_size,
            bytes,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.storage_dim.len()];
        for i in (0..self.storage_dim.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.storage_dim[i + 1];
        }
        strides
    }

    /// Copies `src` into the hyperslab starting at `offsets` with shape
    /// `dims`, recursing one axis at a time so any sub-rectangle of the
    /// buffer — not just a whole-buffer write — is addressable (spec §4.2
    /// "Higher-rank n-D views are computed as arithmetic on storage_dim").
    pub fn write_hyperslab(
        &mut self,
        offsets: &[usize],
        dims: &[usize],
        src: &[u8],
    ) -> Result<(), MechError> {
        self.check_hyperslab(offsets, dims)?;
        let elem_size = self.elem_size;
        let strides = self.strides();
        let mut cursor = 0usize;
        copy_axis(
            &mut self.bytes,
            src,
            &mut cursor,
            offsets,
            dims,
            &strides,
            elem_size,
            0,
            0,
            Direction::IntoBuffer,
        );
        Ok(())
    }

    /// Inverse of [`write_hyperslab`](Self::write_hyperslab): copies the
    /// hyperslab at `offsets`/`dims` out into a freshly allocated `Vec<u8>`.
    pub fn read_hyperslab(&self, offsets: &[usize], dims: &[usize]) -> Result<Vec<u8>, MechError> {
        self.check_hyperslab(offsets, dims)?;
        let elems: usize = dims.iter().product();
        let mut dst = vec![0u8; elems * self.elem_size];
        let strides = self.strides();
        let mut cursor = 0usize;
        // SAFETY-free: we only ever read from `self.bytes`, never mutate it,
        // so the "buffer" parameter of `copy_axis` is `dst` and the source
        // is `self.bytes` — direction flips what plays which role.
        let bytes = self.bytes.clone();
        copy_axis(
            &mut dst,
            &bytes,
            &mut cursor,
            offsets,
            dims,
            &strides,
            elem_size,
            0,
            0,
            Direction::OutOfBuffer,
        );
        Ok(dst)
    }

    fn check_hyperslab(&self, offsets: &[usize], dims: &[usize]) -> Result<(), MechError> {
        if offsets.len() != self.storage_dim.len() || dims.len() != self.storage_dim.len() {
            return Err(MechError::Memory(
                "hyperslab rank mismatch with buffer storage_dim".into(),
            ));
        }
        for i in 0..self.storage_dim.len() {
            if offsets[i] + dims[i] > self.storage_dim[i] {
                return Err(MechError::Memory(format!(
                    "hyperslab axis {i} out of bounds: offset {} + dim {} > storage_dim {}",
                    offsets[i], dims[i], self.storage_dim[i]
                )));
            }
        }
        Ok(())
    }
}

enum Direction {
    IntoBuffer,
    OutOfBuffer,
}

/// Recurses one array axis at a time, computing the linear byte offset at
/// the leaf (innermost) axis from `strides` and copying one run of
/// contiguous elements at a time.
#[allow(clippy::too_many_arguments)]
fn copy_axis(
    buffer: &mut [u8],
    src: &[u8],
    src_cursor: &mut usize,
    offsets: &[usize],
    dims: &[usize],
    strides: &[usize],
    elem_size: usize,
    axis: usize,
    base_index: usize,
    direction: Direction,
) {
    if axis + 1 == offsets.len() {
        let start_index = base_index + offsets[axis];
        let run_len = dims[axis];
        let byte_start = start_index * elem_size;
        let byte_len = run_len * elem_size;
        match direction {
            Direction::IntoBuffer => {
                buffer[byte_start..byte_start + byte_len]
                    .copy_from_slice(&src[*src_cursor..*src_cursor + byte_len]);
            }
            Direction::OutOfBuffer => {
                buffer[*src_cursor..*src_cursor + byte_len]
                    .copy_from_slice(&src[byte_start..byte_start + byte_len]);
            }
        }
        *src_cursor += byte_len;
        return;
    }
    for i in 0..dims[axis] {
        let next_base = base_index + (offsets[axis] + i) * strides[axis];
        copy_axis(
            buffer,
            src,
            src_cursor,
            offsets,
            dims,
            strides,
            elem_size,
            axis + 1,
            next_base,
            match direction {
                Direction::IntoBuffer => Direction::IntoBuffer,
                Direction::OutOfBuffer => Direction::OutOfBuffer,
            },
        );
    }
}

/// Owns every allocated [`Buffer`], keyed by dataset/attribute name.
#[derive(Debug, Default)]
pub struct Arena {
    buffers: HashMap<String, Buffer>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zero-initialized buffer for `name` with the given
    /// pool-wide `storage_dim` and element size. Errors with
    /// [`MechError::DoubleAlloc`] if the slot is already occupied (spec
    /// §4.2).
    pub fn allocate(
        &mut self,
        name: &str,
        storage_dim: Vec<usize>,
        elem_size: usize,
    ) -> Result<(), MechError> {
        if self.buffers.contains_key(name) {
            return Err(MechError::DoubleAlloc(name.to_string()));
        }
        let buf = Buffer::zeroed(storage_dim, elem_size)?;
        trace!(target: "arena", name, bytes = buf.len(), "allocate");
        self.buffers.insert(name.to_string(), buf);
        Ok(())
    }

    pub fn free(&mut self, name: &str) {
        if self.buffers.remove(name).is_some() {
            trace!(target: "arena", name, "free");
        }
    }

    pub fn buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffers.get(name)
    }

    pub fn buffer_mut(&mut self, name: &str) -> Option<&mut Buffer> {
        self.buffers.get_mut(name)
    }

    pub fn write(
        &mut self,
        name: &str,
        offsets: &[usize],
        dims: &[usize],
        src: &[u8],
    ) -> Result<(), MechError> {
        let buf = self
            .buffers
            .get_mut(name)
            .ok_or_else(|| MechError::Memory(format!("write: unknown buffer '{name}'")))?;
        buf.write_hyperslab(offsets, dims, src)
    }

    pub fn read(
        &self,
        name: &str,
        offsets: &[usize],
        dims: &[usize],
    ) -> Result<Vec<u8>, MechError> {
        let buf = self
            .buffers
            .get(name)
            .ok_or_else(|| MechError::Memory(format!("read: unknown buffer '{name}'")))?;
        buf.read_hyperslab(offsets, dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_zero_initialized() {
        let mut arena = Arena::new();
        arena.allocate("result", vec![4, 2], 8).unwrap();
        let buf = arena.buffer("result").unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buf.len(), 4 * 2 * 8);
    }

    #[test]
    fn double_allocate_is_rejected() {
        let mut arena = Arena::new();
        arena.allocate("result", vec![2, 2], 4).unwrap();
        let err = arena.allocate("result", vec![2, 2], 4).unwrap_err();
        assert!(matches!(err, MechError::DoubleAlloc(_)));
    }

    #[test]
    fn hyperslab_round_trips_a_sub_block() {
        let mut arena = Arena::new();
        arena.allocate("board_field", vec![4, 4], 4).unwrap();
        let payload: Vec<u8> = (0..4i32).flat_map(|v| v.to_le_bytes()).collect();
        arena.write("board_field", &[1, 1], &[1, 1], &payload).unwrap();
        arena
            .write("board_field", &[2, 2], &[1, 1], &payload)
            .unwrap();

        let read_back = arena.read("board_field", &[1, 1], &[1, 1]).unwrap();
        assert_eq!(read_back, payload);

        // A different, untouched cell stays zero.
        let untouched = arena.read("board_field", &[0, 0], &[1, 1]).unwrap();
        assert_eq!(untouched, vec![0u8; 4]);
    }

    #[test]
    fn hyperslab_rejects_out_of_bounds() {
        let mut arena = Arena::new();
        arena.allocate("x", vec![2, 2], 4).unwrap();
        let err = arena.write("x", &[1, 1], &[2, 1], &[0u8; 8]).unwrap_err();
        assert!(matches!(err, MechError::Memory(_)));
    }

    #[test]
    fn multi_row_hyperslab_matches_storage_dim_strides() {
        let mut arena = Arena::new();
        // A 3x3 int buffer; write the 2x2 top-left block to [5,6,7,8] and
        // confirm the strides line up with row-major storage_dim.
        arena.allocate("m", vec![3, 3], 4).unwrap();
        let payload: Vec<u8> = [5i32, 6, 7, 8].iter().flat_map(|v| v.to_le_bytes()).collect();
        arena.write("m", &[0, 0], &[2, 2], &payload).unwrap();
        let row0 = arena.read("m", &[0, 0], &[1, 3]).unwrap();
        let row0_vals: Vec<i32> = row0
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(row0_vals, vec![5, 6, 0]);
        let row1 = arena.read("m", &[1, 0], &[1, 3]).unwrap();
        let row1_vals: Vec<i32> = row1
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(row1_vals, vec![7, 8, 0]);
    }
}
