use crate::errors::OmFilesError;
use std::fs::File;
use std::io::Write;

/// Append-only byte sink the writer streams into.
pub trait OmFileWriterBackend {
    fn write(&mut self, data: &[u8]) -> Result<(), OmFilesError>;
    fn synchronize(&self) -> Result<(), OmFilesError>;
}

/// Random-access byte source the reader pulls from.
pub trait OmFileReaderBackend {
    /// Length in bytes.
    fn count(&self) -> u64;
    /// Whether `prefetch_data` advice is worth issuing for this backend.
    fn needs_prefetch(&self) -> bool;
    /// Advisory read-ahead. Correctness must not depend on it.
    fn prefetch_data(&self, offset: u64, count: u64);
    /// Blocking preparation before `get_bytes`. No-op for mapped memory.
    fn pre_read(&self, offset: u64, count: u64) -> Result<(), OmFilesError>;
    fn get_bytes(&self, offset: u64, count: u64) -> Result<&[u8], OmFilesError>;
}

impl<Backend: OmFileWriterBackend> OmFileWriterBackend for &mut Backend {
    fn write(&mut self, data: &[u8]) -> Result<(), OmFilesError> {
        (**self).write(data)
    }

    fn synchronize(&self) -> Result<(), OmFilesError> {
        (**self).synchronize()
    }
}

impl OmFileWriterBackend for File {
    fn write(&mut self, data: &[u8]) -> Result<(), OmFilesError> {
        self.write_all(data).map_err(OmFilesError::from_io)
    }

    fn synchronize(&self) -> Result<(), OmFilesError> {
        self.sync_all().map_err(OmFilesError::from_io)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: Vec<u8>,
}

impl InMemoryBackend {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl OmFileWriterBackend for InMemoryBackend {
    fn write(&mut self, data: &[u8]) -> Result<(), OmFilesError> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn synchronize(&self) -> Result<(), OmFilesError> {
        Ok(())
    }
}

impl OmFileReaderBackend for InMemoryBackend {
    fn count(&self) -> u64 {
        self.data.len() as u64
    }

    fn needs_prefetch(&self) -> bool {
        false
    }

    fn prefetch_data(&self, _offset: u64, _count: u64) {}

    fn pre_read(&self, _offset: u64, _count: u64) -> Result<(), OmFilesError> {
        Ok(())
    }

    fn get_bytes(&self, offset: u64, count: u64) -> Result<&[u8], OmFilesError> {
        let end = offset
            .checked_add(count)
            .ok_or(OmFilesError::FileTooSmall)?;
        if end > self.data.len() as u64 {
            return Err(OmFilesError::FileTooSmall);
        }
        Ok(&self.data[offset as usize..end as usize])
    }
}
