//! Block coder for int16 chunk data: zigzag map, then bitpack in blocks of
//! 128 values with one width byte per block.
//!
//! Contract: `compress` reports bytes written, `decompress` reports bytes
//! consumed and restores the input exactly. Zigzag keeps small positive and
//! negative deltas narrow, so post-delta chunks pack into a few bits per
//! value.

use super::bitpack::{pack, unpack, BLOCK_LEN};
use crate::errors::OmFilesError;

#[inline(always)]
fn zigzag(v: i16) -> u16 {
    ((v << 1) ^ (v >> 15)) as u16
}

#[inline(always)]
fn unzigzag(v: u16) -> i16 {
    ((v >> 1) as i16) ^ -((v & 1) as i16)
}

/// Compress `values` into `out`, returning the number of bytes written.
/// `out` must be sized by [`crate::core::compression::compressed_chunk_bound`].
pub fn compress(values: &[i16], out: &mut [u8]) -> usize {
    let mut pos = 0usize;
    let mut block = [0u16; BLOCK_LEN];
    for run in values.chunks(BLOCK_LEN) {
        let block = &mut block[..run.len()];
        let mut all_bits: u16 = 0;
        for (slot, &v) in block.iter_mut().zip(run) {
            let z = zigzag(v);
            *slot = z;
            all_bits |= z;
        }
        let width = 16 - all_bits.leading_zeros();
        out[pos] = width as u8;
        pos += 1;
        pos += pack(&*block, width, &mut out[pos..]);
    }
    pos
}

/// Decompress exactly `n` values from `bytes` into `out[..n]`, returning the
/// number of bytes consumed.
pub fn decompress(bytes: &[u8], n: usize, out: &mut [i16]) -> Result<usize, OmFilesError> {
    debug_assert!(out.len() >= n);
    let mut pos = 0usize;
    let mut block = [0u16; BLOCK_LEN];
    let mut decoded = 0usize;
    while decoded < n {
        let len = std::cmp::min(BLOCK_LEN, n - decoded);
        let width = *bytes
            .get(pos)
            .ok_or(OmFilesError::CorruptCompressedData("truncated block header"))?
            as u32;
        pos += 1;
        if width > 16 {
            return Err(OmFilesError::CorruptCompressedData("block width exceeds 16"));
        }
        let consumed = unpack(&bytes[pos..], width, &mut block[..len])
            .ok_or(OmFilesError::CorruptCompressedData("truncated block payload"))?;
        pos += consumed;
        for (slot, &z) in out[decoded..decoded + len].iter_mut().zip(&block[..len]) {
            *slot = unzigzag(z);
        }
        decoded += len;
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compression::compressed_chunk_bound;

    fn roundtrip(values: &[i16]) -> usize {
        let mut compressed = vec![0u8; compressed_chunk_bound(values.len(), 2)];
        let written = compress(values, &mut compressed);
        assert!(written <= compressed.len());

        let mut decoded = vec![0i16; values.len()];
        let consumed = decompress(&compressed[..written], values.len(), &mut decoded).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(decoded, values);
        written
    }

    #[test]
    fn test_zigzag_extremes() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(i16::MAX), 65534);
        assert_eq!(zigzag(i16::MIN), 65535);
        for v in [0, 1, -1, 73, -74, i16::MAX, i16::MIN] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    #[test]
    fn test_roundtrip_small() {
        roundtrip(&[0, 1, -1, 5, -5, 100, -100]);
    }

    #[test]
    fn test_roundtrip_block_boundaries() {
        let values: Vec<i16> = (0..1000).map(|i| ((i * 37) % 512 - 256) as i16).collect();
        for len in [1usize, 127, 128, 129, 256, 1000] {
            roundtrip(&values[..len]);
        }
    }

    #[test]
    fn test_small_deltas_pack_tightly() {
        let values = vec![1i16; 128];
        // width 2 over 128 values: 1 header byte + 32 payload bytes
        assert_eq!(roundtrip(&values), 33);
    }

    #[test]
    fn test_corrupt_width_rejected() {
        let bytes = [200u8, 0, 0];
        let mut out = vec![0i16; 4];
        assert!(decompress(&bytes, 4, &mut out).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let values = vec![12345i16; 64];
        let mut compressed = vec![0u8; compressed_chunk_bound(64, 2)];
        let written = compress(&values, &mut compressed);
        let mut out = vec![0i16; 64];
        assert!(decompress(&compressed[..written - 1], 64, &mut out).is_err());
    }
}
