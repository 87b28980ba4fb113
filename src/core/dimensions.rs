use crate::errors::OmFilesError;
use crate::utils::divide_rounded_up;
use std::ops::Range;

/// Shape of an array and its chunk grid.
///
/// All arithmetic is done in `u64` so multi-terabyte arrays index correctly
/// on 32-bit hosts. Chunk indices are flat row-major with the last dimension
/// varying fastest, matching the on-disk chunk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimensions {
    pub dims: Vec<u64>,
    pub chunks: Vec<u64>,
}

impl Dimensions {
    pub fn new(dims: Vec<u64>, chunks: Vec<u64>) -> Self {
        debug_assert_eq!(dims.len(), chunks.len());
        Self { dims, chunks }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn n_elements(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Number of chunks along dimension `i`, counting a trailing short chunk.
    pub fn n_chunks_in_dimension(&self, i: usize) -> u64 {
        divide_rounded_up(self.dims[i], self.chunks[i])
    }

    pub fn n_chunks(&self) -> u64 {
        (0..self.rank())
            .map(|i| self.n_chunks_in_dimension(i))
            .product()
    }

    /// Elements in a full (non-edge) chunk. Used to size scratch buffers.
    pub fn elements_per_chunk(&self) -> u64 {
        self.chunks.iter().product()
    }

    /// Decompose a flat chunk index into per-dimension chunk coordinates.
    pub fn chunk_coordinate(&self, chunk_index: u64) -> Vec<u64> {
        let mut coord = vec![0u64; self.rank()];
        let mut rolling = 1u64;
        for i in (0..self.rank()).rev() {
            let n = self.n_chunks_in_dimension(i);
            coord[i] = (chunk_index / rolling) % n;
            rolling *= n;
        }
        coord
    }

    /// Flat chunk index of per-dimension chunk coordinates.
    pub fn chunk_index(&self, coord: &[u64]) -> u64 {
        let mut index = 0u64;
        for i in 0..self.rank() {
            index = index * self.n_chunks_in_dimension(i) + coord[i];
        }
        index
    }

    /// Extent of chunk `coord` along each dimension, clamped at array edges.
    pub fn chunk_extent(&self, coord: &[u64]) -> Vec<u64> {
        (0..self.rank())
            .map(|i| {
                std::cmp::min((coord[i] + 1) * self.chunks[i], self.dims[i])
                    - coord[i] * self.chunks[i]
            })
            .collect()
    }

    /// Half-open global element ranges covered by chunk `coord`.
    pub fn chunk_global_range(&self, coord: &[u64]) -> Vec<Range<u64>> {
        (0..self.rank())
            .map(|i| {
                let start = coord[i] * self.chunks[i];
                start..std::cmp::min(start + self.chunks[i], self.dims[i])
            })
            .collect()
    }

    pub fn intersects(chunk_range: &[Range<u64>], window: &[Range<u64>]) -> bool {
        chunk_range
            .iter()
            .zip(window)
            .all(|(c, w)| c.start < w.end && w.start < c.end)
    }

    /// Per-axis intersection of a chunk's global range with a read window.
    pub fn clamped(chunk_range: &[Range<u64>], window: &[Range<u64>]) -> Vec<Range<u64>> {
        chunk_range
            .iter()
            .zip(window)
            .map(|(c, w)| std::cmp::max(c.start, w.start)..std::cmp::min(c.end, w.end))
            .collect()
    }

    /// Validate a read window against the array shape.
    pub fn check_read_window(&self, window: &[Range<u64>]) -> Result<(), OmFilesError> {
        if window.len() != self.rank() {
            return Err(OmFilesError::MismatchingDimensionCount {
                expected: self.rank(),
                got: window.len(),
            });
        }
        for (axis, range) in window.iter().enumerate() {
            if range.start > range.end || range.end > self.dims[axis] {
                return Err(OmFilesError::DimensionOutOfBounds {
                    axis,
                    range: range.clone(),
                    allowed: self.dims[axis],
                });
            }
        }
        Ok(())
    }
}
