use memmap2::{Advice, Mmap, MmapOptions};
use std::fs::File;

use crate::backend::backends::OmFileReaderBackend;
use crate::errors::OmFilesError;

/// A read-only memory-mapped file.
pub struct MmapFile {
    data: Mmap,
    file: File,
}

impl MmapFile {
    /// Map the entire file handle.
    pub fn new(file: File) -> Result<Self, std::io::Error> {
        let data = unsafe { MmapOptions::new().map(&file)? };
        Ok(MmapFile { data, file })
    }

    /// Check if the file was deleted on the file system. Linux keeps the
    /// mapping alive as long as some process has the file open.
    pub fn was_deleted(&self) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            match self.file.metadata() {
                Ok(meta) => meta.nlink() == 0,
                Err(_) => false,
            }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Tell the OS to fault in the pages covering `offset..offset+count`.
    /// Subsequent reads of that range should not block on disk.
    fn prefetch_advice(&self, offset: usize, count: usize) {
        let page_size = 4096;
        let page_start = offset / page_size * page_size;
        let page_end = (offset + count + page_size - 1) / page_size * page_size;
        let length = std::cmp::min(page_end, self.data.len()) - page_start;
        let _ = self.data.advise_range(Advice::WillNeed, page_start, length);
    }
}

impl OmFileReaderBackend for MmapFile {
    fn count(&self) -> u64 {
        self.data.len() as u64
    }

    fn needs_prefetch(&self) -> bool {
        true
    }

    fn prefetch_data(&self, offset: u64, count: u64) {
        self.prefetch_advice(offset as usize, count as usize);
    }

    fn pre_read(&self, _offset: u64, _count: u64) -> Result<(), OmFilesError> {
        // No-op for mapped memory
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
