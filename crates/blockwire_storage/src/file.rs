//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A single-file storage backend.
///
/// # Durability
///
/// - `flush()` pushes buffered data to the OS
/// - `sync()` calls `File::sync_all()` so data is on disk
///
/// # Locking
///
/// [`FileBackend::open_locked`] takes an exclusive advisory lock on the
/// file for the lifetime of the backend. A second locked open, from this
/// process or another, fails with [`StorageError::Locked`]. The lock is
/// released when the backend is dropped.
///
/// # Example
///
/// ```no_run
/// use blockwire_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open_locked(Path::new("content.log")).unwrap();
/// backend.append(b"record").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<Inner>,
    locked: bool,
}

#[derive(Debug)]
struct Inner {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens or creates a file backend without locking.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, size }),
            locked: false,
        })
    }

    /// Opens or creates a file backend and takes an exclusive advisory lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the lock.
    pub fn open_locked(path: &Path) -> StorageResult<Self> {
        let mut backend = Self::open(path)?;
        {
            let inner = backend.inner.lock();
            if inner.file.try_lock_exclusive().is_err() {
                return Err(StorageError::Locked(path.to_path_buf()));
            }
        }
        backend.locked = true;
        Ok(backend)
    }

    /// Opens or creates a locked backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened and locked.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open_locked(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if this handle holds the advisory lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let size = inner.size;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let mut buffer = vec![0u8; len];
        if len > 0 {
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let mut inner = self.inner.lock();
        let size = inner.size;
        if offset > size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: buf.len(),
                size,
            });
        }
        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let n = buf.len().min(available);
        if n > 0 {
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.read_exact(&mut buf[..n])?;
        }
        Ok(n)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.append_vectored(&[data])
    }

    fn append_vectored(&mut self, parts: &[&[u8]]) -> StorageResult<u64> {
        let inner = self.inner.get_mut();
        let offset = inner.size;
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total == 0 {
            return Ok(offset);
        }

        inner.file.seek(SeekFrom::Start(offset))?;
        let mut slices: Vec<IoSlice<'_>> = parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| IoSlice::new(p))
            .collect();
        let mut remaining = &mut slices[..];
        while !remaining.is_empty() {
            let written = inner.file.write_vectored(remaining)?;
            if written == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            IoSlice::advance_slices(&mut remaining, written);
        }
        inner.size += total as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.get_mut().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.get_mut().file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        if new_size > inner.size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: inner.size,
            });
        }

        inner.file.set_len(new_size)?;
        inner.file.sync_all()?;
        inner.size = new_size;
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if self.locked {
            let _ = self.inner.get_mut().file.unlock();
        }
    }
}
