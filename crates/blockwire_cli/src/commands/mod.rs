//! CLI command implementations.

pub mod dump;
pub mod record;
pub mod serve;
pub mod tail;
pub mod verify;

use blockwire_storage::FileBackend;
use clap::ValueEnum;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Output format shared by the log commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// One line per record.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Errors the commands report before any log is read.
#[derive(Debug, Error)]
pub enum CliError {
    /// No file at the given path.
    #[error("log file not found: {0}")]
    LogNotFound(PathBuf),

    /// The log failed verification.
    #[error("log verification failed")]
    VerificationFailed,
}

/// Opens an existing log without locking it or creating it.
pub fn open_log(path: &Path) -> Result<FileBackend, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(CliError::LogNotFound(path.to_path_buf()).into());
    }
    Ok(FileBackend::open(path)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use blockwire_codec::{BufferPool, Value, Writer};
    use blockwire_core::{Timestamp, Transaction};
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// A small log: header, one project setting, one block boundary.
    pub fn sample_records() -> Vec<Transaction> {
        vec![
            Transaction::header(1, Timestamp(10)),
            Transaction::project_meta("title", Value::Text("demo".into()), Timestamp(11)),
            Transaction::block_boundary(1, Timestamp(12)),
        ]
    }

    pub fn write_log(records: &[Transaction], garbage: &[u8]) -> NamedTempFile {
        let mut writer = Writer::with_pool(BufferPool::new(64));
        for tx in records {
            tx.encode(&mut writer);
        }
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&writer.to_vec()).unwrap();
        file.write_all(garbage).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn missing_log_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.log");
        let err = super::open_log(&missing).unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(!missing.exists());
    }
}
