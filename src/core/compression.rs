use serde::{Deserialize, Serialize};

use crate::errors::OmFilesError;

/// How chunk data is filtered and coded on disk.
///
/// The numeric discriminants are stored in legacy headers and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionType {
    /// Scale to int16, 2D delta along the last dimension, zigzag bitpack.
    PforDelta2dInt16 = 0,
    /// Keep float32 bits, 2D XOR delta along the last dimension, XOR bitpack.
    FpxXor2d = 1,
    /// Like `PforDelta2dInt16` but scaling `log10(1 + value)`.
    PforDelta2dInt16Logarithmic = 3,
}

impl CompressionType {
    pub fn bytes_per_element(&self) -> usize {
        match self {
            CompressionType::PforDelta2dInt16 | CompressionType::PforDelta2dInt16Logarithmic => 2,
            CompressionType::FpxXor2d => 4,
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = OmFilesError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::PforDelta2dInt16),
            1 => Ok(CompressionType::FpxXor2d),
            3 => Ok(CompressionType::PforDelta2dInt16Logarithmic),
            _ => Err(OmFilesError::InvalidCompressionType),
        }
    }
}

/// Worst-case compressed size of a chunk of `n` elements.
///
/// The block coders add one width byte per 128 elements; the remaining slack
/// covers partial trailing blocks. The buffered writer uses this bound as its
/// flush threshold, so it must never be exceeded by the actual encoders.
pub fn compressed_chunk_bound(n: usize, bytes_per_element: usize) -> usize {
    ((n + 255) / 256 + (n + 32)) * bytes_per_element
}
