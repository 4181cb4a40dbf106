//! Tail command implementation.

use super::record::{self, RecordView};
use super::{open_log, Format};
use blockwire_codec::{BufferPool, DEFAULT_BLOCK_SIZE};
use blockwire_core::{inspect, BackwardReader};
use blockwire_storage::StorageBackend;
use std::path::Path;

/// Runs the tail command.
pub fn run(path: &Path, count: usize, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_log(path)?;
    let records = last_records(&backend, count)?;
    record::print(&records, format)?;
    Ok(())
}

/// Returns the last `count` complete records, oldest first.
pub fn last_records(
    backend: &dyn StorageBackend,
    count: usize,
) -> Result<Vec<RecordView>, Box<dyn std::error::Error>> {
    let pool = BufferPool::new(DEFAULT_BLOCK_SIZE);
    let (schema, report) = inspect(backend, pool.clone())?;

    let mut records = BackwardReader::new(backend, pool, report.end_offset)
        .take(count)
        .map(|logged| logged.map(|logged| RecordView::new(&logged, &schema)))
        .collect::<Result<Vec<_>, _>>()?;
    records.reverse();
    Ok(records)
}
