use crate::backend::backends::OmFileWriterBackend;
use crate::errors::OmFilesError;

/// All data is staged in a buffer before it is flushed to a backend, keeping
/// sink writes large and strictly sequential.
pub struct OmBufferedWriter<Backend: OmFileWriterBackend> {
    buffer: Vec<u8>,
    /// The final backing store to write data to.
    pub backend: Backend,
    /// Current write position in the buffer.
    pub write_position: usize,
    /// Total bytes written including flushed data.
    pub total_bytes_written: u64,
    /// Initial capacity, used as the growth quantum on reallocation.
    initial_capacity: usize,
}

impl<Backend: OmFileWriterBackend> OmBufferedWriter<Backend> {
    pub fn new(backend: Backend, initial_capacity: usize) -> Self {
        Self {
            buffer: vec![0; initial_capacity],
            backend,
            write_position: 0,
            total_bytes_written: 0,
            initial_capacity,
        }
    }

    pub fn increment_write_position(&mut self, bytes: usize) {
        self.write_position += bytes;
        self.total_bytes_written += bytes as u64;
    }

    /// How many bytes are left in the write buffer.
    pub fn remaining_capacity(&self) -> usize {
        self.buffer.len() - self.write_position
    }

    /// Mutable slice starting at the current write position.
    pub fn buffer_at_write_position(&mut self) -> &mut [u8] {
        &mut self.buffer[self.write_position..]
    }

    /// Append raw bytes, growing or flushing as needed.
    pub fn append(&mut self, data: &[u8]) -> Result<(), OmFilesError> {
        self.reallocate(data.len())?;
        let pos = self.write_position;
        self.buffer[pos..pos + data.len()].copy_from_slice(data);
        self.increment_write_position(data.len());
        Ok(())
    }

    /// Make room for at least `minimum_capacity` more bytes, flushing buffered
    /// data to the backend first and growing the buffer only if one chunk
    /// alone exceeds it.
    pub fn reallocate(&mut self, minimum_capacity: usize) -> Result<(), OmFilesError> {
        if self.remaining_capacity() >= minimum_capacity {
            return Ok(());
        }

        self.flush()?;

        if self.buffer.len() >= minimum_capacity {
            return Ok(());
        }

        let new_capacity = ((minimum_capacity + self.initial_capacity - 1) / self.initial_capacity)
            * self.initial_capacity;
        self.buffer.resize(new_capacity, 0);

        Ok(())
    }

    /// Write all buffered bytes to the backend.
    pub fn flush(&mut self) -> Result<(), OmFilesError> {
        if self.write_position == 0 {
            return Ok(());
        }

        self.backend.write(&self.buffer[..self.write_position])?;
        self.write_position = 0;

        // Stale bytes must not leak into padded regions
        self.buffer.fill(0);

        Ok(())
    }
}
