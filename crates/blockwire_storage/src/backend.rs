//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};

/// A low-level append-only byte store.
///
/// # Invariants
///
/// - `append` and `append_vectored` return the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - a vectored append lands contiguously; parts are never interleaved with
///   another append
/// - `sync` makes every appended byte survive process termination
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`] if the range is not fully
    /// written, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at the end of
    /// storage. Streaming readers use this to fill pooled blocks.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`] if `offset` is beyond the end.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let size = self.size()?;
        if offset > size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: buf.len(),
                size,
            });
        }
        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let n = buf.len().min(available);
        let data = self.read_at(offset, n)?;
        buf[..n].copy_from_slice(&data);
        Ok(n)
    }

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Appends several slices as one contiguous write.
    ///
    /// Returns the offset of the first byte. The log uses this to append a
    /// record straight from the blocks of its chain.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append_vectored(&mut self, parts: &[&[u8]]) -> StorageResult<u64> {
        let joined = parts.concat();
        self.append(&joined)
    }

    /// Flushes pending writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the storage back to `new_size` bytes.
    ///
    /// The log uses this to drop a torn final record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TruncateBeyondEnd`] if `new_size` exceeds the
    /// current size, or an I/O error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        (**self).read_into(offset, buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        (**self).append(data)
    }

    fn append_vectored(&mut self, parts: &[&[u8]]) -> StorageResult<u64> {
        (**self).append_vectored(parts)
    }

    fn flush(&mut self) -> StorageResult<()> {
        (**self).flush()
    }

    fn size(&self) -> StorageResult<u64> {
        (**self).size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        (**self).sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        (**self).truncate(new_size)
    }
}
