//! Error types for the transaction log.

use crate::types::{DefinitionId, EntityId};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in log operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] blockwire_storage::StorageError),

    /// Encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] blockwire_codec::CodecError),

    /// The log holds bytes that can never form a valid record.
    #[error("log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Offset of the record that failed to parse.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Leading and trailing sentinels of a transaction differ.
    #[error("transaction {what} mismatch: leading {leading}, trailing {trailing}")]
    SentinelMismatch {
        /// Which sentinel disagreed ("definition id" or "field count").
        what: &'static str,
        /// Sentinel read first.
        leading: u64,
        /// Sentinel read last.
        trailing: u64,
    },

    /// The log header names a format this build cannot read.
    #[error("unsupported log format version {found} (supported up to {supported})")]
    UnsupportedFormat {
        /// Version in the log header.
        found: u64,
        /// Highest version this build reads.
        supported: u64,
    },

    /// A registered table disagrees with the schema stored in the log.
    #[error("schema conflict: {message}")]
    SchemaConflict {
        /// Description of the conflict.
        message: String,
    },

    /// A record is well-formed but semantically invalid.
    #[error("invalid record: {message}")]
    InvalidRecord {
        /// Why the record was rejected.
        message: String,
    },

    /// No table is registered for the requested record type.
    #[error("no table registered for {type_name}")]
    UnknownType {
        /// Rust type name of the record.
        type_name: &'static str,
    },

    /// Entity not found in its table.
    #[error("{entity} not found in {definition}")]
    EntityNotFound {
        /// Entity type searched.
        definition: DefinitionId,
        /// Missing entity.
        entity: EntityId,
    },

    /// The log ends in an incomplete record that was not repaired.
    #[error("log has a torn tail at offset {offset}; writes are disabled")]
    TornTail {
        /// Offset of the incomplete record.
        offset: u64,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Create a log corruption error.
    pub fn log_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Create a schema conflict error.
    pub fn schema_conflict(message: impl Into<String>) -> Self {
        Self::SchemaConflict {
            message: message.into(),
        }
    }

    /// Create an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Create an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if more bytes could complete the record being decoded.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Codec(e) if e.is_eof())
    }
}
