use crate::core::compression::CompressionType;
use crate::errors::OmFilesError;

/// Fixed-size header of legacy version 1 and 2 files.
///
/// Version 3 files only carry the three magic/version bytes up front; all
/// remaining parameters moved to the JSON trailer so they can be written
/// after the chunk stream without seeking back.
#[derive(Debug, Clone, PartialEq)]
pub struct OmHeader {
    pub version: u8,
    pub compression: CompressionType,
    pub scale_factor: f32,
    pub dim0: u64,
    pub dim1: u64,
    pub chunk0: u64,
    pub chunk1: u64,
}

impl OmHeader {
    pub const MAGIC_NUMBER1: u8 = 79; // 'O'
    pub const MAGIC_NUMBER2: u8 = 77; // 'M'
    /// Version written by this crate.
    pub const VERSION: u8 = 3;
    /// Bytes of the version 3 header: two magic bytes plus the version.
    pub const LENGTH: usize = 3;
    /// Bytes of the fixed version 1/2 header.
    pub const LEGACY_LENGTH: usize = 40;
    /// Bytes of the version 3 trailer: JSON length as little-endian u64.
    pub const TRAILER_LENGTH: usize = 8;

    /// Parse a version 1/2 header from its fixed 40-byte layout.
    pub fn legacy_from_bytes(bytes: &[u8]) -> Result<Self, OmFilesError> {
        if bytes.len() < Self::LEGACY_LENGTH {
            return Err(OmFilesError::FileTooSmall);
        }
        if bytes[0] != Self::MAGIC_NUMBER1 || bytes[1] != Self::MAGIC_NUMBER2 {
            return Err(OmFilesError::NotAnOmFile);
        }
        let version = bytes[2];
        if version != 1 && version != 2 {
            return Err(OmFilesError::UnsupportedVersion(version));
        }
        // The version 1 compression byte was never initialized by its writer.
        // All version 1 files store scaled int16 data.
        let compression = if version == 1 {
            CompressionType::PforDelta2dInt16
        } else {
            CompressionType::try_from(bytes[3])?
        };
        let read_u64 =
            |range: std::ops::Range<usize>| u64::from_le_bytes(bytes[range].try_into().unwrap());
        let mut scale = [0u8; 4];
        scale.copy_from_slice(&bytes[4..8]);
        Ok(Self {
            version,
            compression,
            scale_factor: f32::from_le_bytes(scale),
            dim0: read_u64(8..16),
            dim1: read_u64(16..24),
            chunk0: read_u64(24..32),
            chunk1: read_u64(32..40),
        })
    }

    /// Serialize to the fixed 40-byte layout of version 1/2 files.
    pub fn legacy_as_bytes(&self) -> [u8; Self::LEGACY_LENGTH] {
        let mut bytes = [0u8; Self::LEGACY_LENGTH];
        bytes[0] = Self::MAGIC_NUMBER1;
        bytes[1] = Self::MAGIC_NUMBER2;
        bytes[2] = self.version;
        bytes[3] = self.compression as u8;
        bytes[4..8].copy_from_slice(&self.scale_factor.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.dim0.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.dim1.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.chunk0.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.chunk1.to_le_bytes());
        bytes
    }
}
