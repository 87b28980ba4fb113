use serde::{Deserialize, Serialize};

use crate::core::compression::CompressionType;

/// Top-level JSON structure stored in the trailer of version 3 files.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OmFileJson {
    /// A list of variables inside this file.
    pub variables: Vec<OmFileJsonVariable>,
}

/// A variable inside an OM file.
///
/// `dimensions` and `chunks` describe the shape of the data, `compression`,
/// `scale_factor` and `add_offset` define how values are coded, and the
/// `lut_*` fields locate chunk data inside the file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OmFileJsonVariable {
    pub name: Option<String>,
    pub dimensions: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dimension_names: Option<Vec<String>>,
    pub scale_factor: f32,
    pub add_offset: f32,
    pub compression: CompressionType,
    pub n_chunks: u64,
    /// Absolute byte offset of the compressed lookup table.
    pub lut_offset: u64,
    /// On-disk stride of one compressed lookup-table sub-chunk.
    pub lut_chunk_length: u64,
    /// Number of offsets grouped into one lookup-table sub-chunk.
    pub lut_sub_chunk_size: u64,
}
