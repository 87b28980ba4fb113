//! Coder for lookup-table sub-chunks: a run of non-decreasing u64 offsets is
//! stored as a raw first offset, one width byte, and the bitpacked deltas.
//!
//! Every sub-chunk of a file is padded to the same on-disk stride, so entry
//! `k` can be located without decompressing the rest of the table.

use super::bitpack::{pack, unpack};
use crate::errors::OmFilesError;

const HEAD_LEN: usize = 9;

fn delta_width(offsets: &[u64]) -> u32 {
    let mut all_bits = 0u64;
    for pair in offsets.windows(2) {
        all_bits |= pair[1].wrapping_sub(pair[0]);
    }
    64 - all_bits.leading_zeros()
}

/// Exact compressed size of one sub-chunk, without writing it. The writer
/// uses this to determine the padded stride before emitting anything.
pub fn compressed_size(offsets: &[u64]) -> usize {
    debug_assert!(!offsets.is_empty());
    let width = delta_width(offsets) as usize;
    HEAD_LEN + ((offsets.len() - 1) * width + 7) / 8
}

/// Compress one sub-chunk of offsets into `out`, returning bytes written.
/// Offsets must be non-decreasing.
pub fn compress(offsets: &[u64], out: &mut [u8]) -> usize {
    debug_assert!(!offsets.is_empty());
    debug_assert!(offsets.windows(2).all(|p| p[0] <= p[1]));
    out[0..8].copy_from_slice(&offsets[0].to_le_bytes());
    let width = delta_width(offsets);
    out[8] = width as u8;
    let deltas: Vec<u64> = offsets.windows(2).map(|p| p[1] - p[0]).collect();
    HEAD_LEN + pack(deltas.as_slice(), width, &mut out[HEAD_LEN..])
}

/// Decompress exactly `n` offsets from `bytes` into `out[..n]`, returning
/// bytes consumed.
pub fn decompress(bytes: &[u8], n: usize, out: &mut [u64]) -> Result<usize, OmFilesError> {
    debug_assert!(out.len() >= n);
    if n == 0 {
        return Ok(0);
    }
    if bytes.len() < HEAD_LEN {
        return Err(OmFilesError::CorruptLut {
            reason: "sub-chunk shorter than header",
        });
    }
    let mut first = [0u8; 8];
    first.copy_from_slice(&bytes[0..8]);
    out[0] = u64::from_le_bytes(first);
    let width = bytes[8] as u32;
    if width > 64 {
        return Err(OmFilesError::CorruptLut {
            reason: "delta width exceeds 64",
        });
    }
    let consumed = unpack(&bytes[HEAD_LEN..], width, &mut out[1..n]).ok_or(
        OmFilesError::CorruptLut {
            reason: "truncated sub-chunk payload",
        },
    )?;
    for i in 1..n {
        out[i] = out[i - 1].wrapping_add(out[i]);
    }
    Ok(HEAD_LEN + consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(offsets: &[u64]) {
        let size = compressed_size(offsets);
        let mut buffer = vec![0u8; size];
        assert_eq!(compress(offsets, &mut buffer), size);

        let mut decoded = vec![0u64; offsets.len()];
        assert_eq!(decompress(&buffer, offsets.len(), &mut decoded).unwrap(), size);
        assert_eq!(decoded, offsets);
    }

    #[test]
    fn test_roundtrip() {
        roundtrip(&[0]);
        roundtrip(&[0, 0, 0]);
        roundtrip(&[0, 17, 17, 300, 1234567]);
        roundtrip(&(0..256u64).map(|i| i * 97).collect::<Vec<_>>());
    }

    #[test]
    fn test_large_offsets() {
        // offsets near the top of the u64 range still code exactly
        let base = u64::MAX - 10_000;
        roundtrip(&[base, base + 5, base + 5000, u64::MAX]);
    }

    #[test]
    fn test_constant_offsets_stay_small() {
        let offsets = vec![42u64; 256];
        assert_eq!(compressed_size(&offsets), 9);
    }

    #[test]
    fn test_truncated_rejected() {
        let offsets: Vec<u64> = (0..100u64).map(|i| i * 1000).collect();
        let size = compressed_size(&offsets);
        let mut buffer = vec![0u8; size];
        compress(&offsets, &mut buffer);
        let mut decoded = vec![0u64; offsets.len()];
        assert!(decompress(&buffer[..size - 1], offsets.len(), &mut decoded).is_err());
        assert!(decompress(&buffer[..4], offsets.len(), &mut decoded).is_err());
    }
}
