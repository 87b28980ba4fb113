use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum OmFilesError {
    #[error("Cannot open file '{filename}': errno {errno}, error: {error}")]
    CannotOpenFile {
        filename: String,
        errno: i32,
        error: String,
    },
    #[error("File writer error: errno {errno}, error: {error}")]
    FileWriterError { errno: i32, error: String },
    #[error("File exists already: {filename}")]
    FileExistsAlready { filename: String },
    #[error("Cannot move file from '{from}' to '{to}': {error}")]
    CannotMoveFile {
        from: String,
        to: String,
        error: String,
    },
    #[error("Not an OM file")]
    NotAnOmFile,
    #[error("Unsupported OM file version {0}")]
    UnsupportedVersion(u8),
    #[error("File too small")]
    FileTooSmall,
    #[error("Invalid compression type")]
    InvalidCompressionType,
    #[error("JSON metadata error: {0}")]
    JsonError(String),
    #[error("Dimension must be larger than 0")]
    DimensionMustBeLargerThan0,
    #[error("Chunk dimension is larger than overall dimension")]
    ChunkDimensionIsSmallerThanOverallDim,
    #[error("Mismatching dimension count: expected {expected}, got {got}")]
    MismatchingDimensionCount { expected: usize, got: usize },
    #[error("Dimension {axis} out of bounds: range {range:?}, allowed {allowed}")]
    DimensionOutOfBounds {
        axis: usize,
        range: std::ops::Range<u64>,
        allowed: u64,
    },
    #[error(
        "Offset and count exceed dimension: offset {offset}, count {count}, dimension {dimension}"
    )]
    OffsetAndCountExceedDimension {
        offset: u64,
        count: u64,
        dimension: u64,
    },
    #[error("Chunk has wrong number of elements")]
    ChunkHasWrongNumberOfElements,
    #[error("Chunks must be written in ascending order: all {total} chunks already written")]
    TooManyChunksWritten { total: u64 },
    #[error("Not all chunks written before sealing: {written} of {expected}")]
    NotAllChunksWritten { written: u64, expected: u64 },
    #[error("Writer is already sealed")]
    WriterAlreadySealed,
    #[error("Corrupt chunk lookup table: {reason}")]
    CorruptLut { reason: &'static str },
    #[error(
        "Chunk {chunk_index} decode mismatch: expected {expected} compressed bytes, consumed {actual}"
    )]
    ChunkDecodeMismatch {
        chunk_index: u64,
        expected: u64,
        actual: u64,
    },
    #[error("Corrupt compressed data: {0}")]
    CorruptCompressedData(&'static str),
    #[error("Array not contiguous")]
    ArrayNotContiguous,
}

impl OmFilesError {
    pub(crate) fn from_io(error: std::io::Error) -> Self {
        OmFilesError::FileWriterError {
            errno: error.raw_os_error().unwrap_or(0),
            error: error.to_string(),
        }
    }
}
