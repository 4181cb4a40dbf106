//! Streaming record readers.
//!
//! Both readers pull the log through pooled blocks, so memory stays bounded
//! by the largest record rather than the size of the log.
//!
//! - An incomplete final record is the end of the log, not an error; the
//!   forward reader reports its offset as the torn tail.
//! - Structural damage (reserved marker, bad tag, sentinel mismatch) is
//!   [`CoreError::LogCorruption`].

use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use blockwire_codec::{BufferPool, Chain};
use blockwire_storage::StorageBackend;

/// One record and where it lives in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRecord {
    /// Offset of the first byte.
    pub offset: u64,
    /// Encoded length.
    pub len: usize,
    /// Decoded record.
    pub transaction: Transaction,
}

impl LoggedRecord {
    /// Returns the offset just past the record.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// Reads records front to back.
///
/// # Example
///
/// ```
/// use blockwire_codec::BufferPool;
/// use blockwire_core::{ForwardReader, Transaction, Timestamp};
/// use blockwire_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let pool = BufferPool::new(64);
/// let header = Transaction::header(1, Timestamp(0));
/// backend.append(&header.to_chain(&pool).to_vec()).unwrap();
///
/// let records: Vec<_> = ForwardReader::new(&backend, pool)
///     .unwrap()
///     .collect::<Result<_, _>>()
///     .unwrap();
/// assert_eq!(records[0].transaction, header);
/// ```
pub struct ForwardReader<'a> {
    backend: &'a dyn StorageBackend,
    pool: BufferPool,
    /// Loaded but not yet decoded bytes.
    window: Chain,
    /// Log offset of the first byte in the window.
    window_offset: u64,
    /// Next log offset to load.
    read_offset: u64,
    /// Log size when the reader was created.
    end: u64,
    torn_tail: Option<u64>,
    blocks_read: u64,
    finished: bool,
}

impl<'a> ForwardReader<'a> {
    /// Creates a reader over the whole log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a dyn StorageBackend, pool: BufferPool) -> CoreResult<Self> {
        Self::starting_at(backend, pool, 0)
    }

    /// Creates a reader starting at a known record boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn starting_at(
        backend: &'a dyn StorageBackend,
        pool: BufferPool,
        offset: u64,
    ) -> CoreResult<Self> {
        let end = backend.size()?;
        Ok(Self {
            backend,
            window: Chain::new(pool.clone()),
            pool,
            window_offset: offset,
            read_offset: offset,
            end,
            torn_tail: None,
            blocks_read: 0,
            finished: false,
        })
    }

    /// Returns the offset of an incomplete final record, once reached.
    #[must_use]
    pub fn torn_tail(&self) -> Option<u64> {
        self.torn_tail
    }

    /// Returns the offset just past the last complete record read.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.window_offset
    }

    /// Returns the number of blocks loaded from the backend.
    #[must_use]
    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    /// Reads the next record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] for structural damage, or a
    /// storage error.
    pub fn next_record(&mut self) -> CoreResult<Option<LoggedRecord>> {
        loop {
            if self.window.is_empty() && self.read_offset >= self.end {
                return Ok(None);
            }
            let decoded = {
                let mut segment = self.window.segment();
                Transaction::decode(&mut segment).map(|tx| (tx, segment.consumed()))
            };
            match decoded {
                Ok((transaction, len)) => {
                    let offset = self.window_offset;
                    self.window.consume(len);
                    self.window_offset += len as u64;
                    return Ok(Some(LoggedRecord {
                        offset,
                        len,
                        transaction,
                    }));
                }
                Err(e) if e.is_incomplete() => {
                    if !self.fill()? {
                        self.torn_tail = Some(self.window_offset);
                        self.window.clear();
                        return Ok(None);
                    }
                }
                Err(e) => return Err(CoreError::log_corruption(self.window_offset, e.to_string())),
            }
        }
    }

    /// Loads one more block into the window. Returns false at end of log.
    fn fill(&mut self) -> CoreResult<bool> {
        if self.read_offset >= self.end {
            return Ok(false);
        }
        let mut block = self.pool.get();
        let want = usize::try_from(self.end - self.read_offset)
            .unwrap_or(usize::MAX)
            .min(block.remaining());
        let n = self
            .backend
            .read_into(self.read_offset, &mut block.spare_mut()[..want])?;
        if n == 0 {
            return Ok(false);
        }
        block.advance(n);
        self.read_offset += n as u64;
        self.blocks_read += 1;
        self.window.push(block);
        Ok(true)
    }
}

impl Iterator for ForwardReader<'_> {
    type Item = CoreResult<LoggedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads records back to front, from a known record boundary.
///
/// Each record is located through its trailing definition id and field
/// count, so no index is needed. Bytes are loaded in blocks from the end
/// and prepended to the window as the reader walks toward offset 0.
pub struct BackwardReader<'a> {
    backend: &'a dyn StorageBackend,
    pool: BufferPool,
    window: Chain,
    /// Log offset of the first byte in the window.
    window_start: u64,
    /// Log offset just past the last byte in the window.
    window_end: u64,
    finished: bool,
}

impl<'a> BackwardReader<'a> {
    /// Creates a reader that walks back from `end`.
    ///
    /// `end` must be a record boundary, normally the end of the last
    /// complete record.
    #[must_use]
    pub fn new(backend: &'a dyn StorageBackend, pool: BufferPool, end: u64) -> Self {
        Self {
            backend,
            window: Chain::new(pool.clone()),
            pool,
            window_start: end,
            window_end: end,
            finished: false,
        }
    }

    /// Reads the previous record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] if the bytes before the cursor
    /// do not end in a complete record, or a storage error.
    pub fn next_record(&mut self) -> CoreResult<Option<LoggedRecord>> {
        loop {
            if self.window_end == 0 {
                return Ok(None);
            }
            let decoded = {
                let mut segment = self.window.segment();
                Transaction::decode_backward(&mut segment).map(|tx| (tx, segment.consumed_back()))
            };
            match decoded {
                Ok((transaction, len)) => {
                    self.window.trim_back(len);
                    self.window_end -= len as u64;
                    return Ok(Some(LoggedRecord {
                        offset: self.window_end,
                        len,
                        transaction,
                    }));
                }
                Err(e) if e.is_incomplete() && self.window_start > 0 => self.fill()?,
                Err(e) if e.is_incomplete() => {
                    return Err(CoreError::log_corruption(
                        0,
                        format!("{} bytes before offset {} form no record", self.window_end, self.window_end),
                    ))
                }
                Err(e) => {
                    return Err(CoreError::log_corruption(
                        self.window_end,
                        format!("record ending here: {e}"),
                    ))
                }
            }
        }
    }

    /// Prepends the block that ends at the window start.
    fn fill(&mut self) -> CoreResult<()> {
        let mut block = self.pool.get();
        let want = usize::try_from(self.window_start)
            .unwrap_or(usize::MAX)
            .min(block.remaining());
        let from = self.window_start - want as u64;
        let n = self.backend.read_into(from, &mut block.spare_mut()[..want])?;
        if n != want {
            return Err(CoreError::log_corruption(from, "log shrank while reading"));
        }
        block.advance(n);
        self.window.push_front(block);
        self.window_start = from;
        Ok(())
    }
}

impl Iterator for BackwardReader<'_> {
    type Item = CoreResult<LoggedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
