//! Dump command implementation.

use super::record::{self, RecordView};
use super::{open_log, Format};
use blockwire_codec::{BufferPool, DEFAULT_BLOCK_SIZE};
use blockwire_core::{inspect, ForwardReader};
use blockwire_storage::StorageBackend;
use std::path::Path;
use tracing::{debug, warn};

/// Runs the dump command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    start_offset: u64,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_log(path)?;
    let records = read_records(&backend, start_offset, limit)?;
    record::print(&records, format)?;
    Ok(())
}

/// Reads records from `start_offset`, which must be a record boundary.
///
/// Names come from a replay of the whole log, so schema records before
/// `start_offset` still resolve.
pub fn read_records(
    backend: &dyn StorageBackend,
    start_offset: u64,
    limit: Option<usize>,
) -> Result<Vec<RecordView>, Box<dyn std::error::Error>> {
    let pool = BufferPool::new(DEFAULT_BLOCK_SIZE);
    let (schema, report) = inspect(backend, pool.clone())?;
    debug!(records = report.records, "log replayed");

    let mut reader = ForwardReader::starting_at(backend, pool, start_offset)?;
    let mut records = Vec::new();
    while limit.map_or(true, |limit| records.len() < limit) {
        match reader.next_record()? {
            Some(logged) => records.push(RecordView::new(&logged, &schema)),
            None => break,
        }
    }
    if let Some(offset) = reader.torn_tail() {
        warn!(offset, "log ends in an incomplete record");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{sample_records, write_log};
    use blockwire_storage::FileBackend;

    #[test]
    fn dumps_every_record_in_order() {
        let file = write_log(&sample_records(), &[]);
        let backend = FileBackend::open(file.path()).unwrap();
        let records = read_records(&backend, 0, None).unwrap();

        let kinds: Vec<&str> = records.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, ["Transaction", "ProjectMeta", "BlockBoundary"]);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[1].offset, records[0].len as u64);
    }

    #[test]
    fn limit_and_offset_select_a_window() {
        let file = write_log(&sample_records(), &[]);
        let backend = FileBackend::open(file.path()).unwrap();
        let all = read_records(&backend, 0, None).unwrap();

        let window = read_records(&backend, all[1].offset, Some(1)).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].kind, "ProjectMeta");
    }

    #[test]
    fn torn_tail_is_skipped() {
        let records = sample_records();
        let mut partial = Vec::new();
        {
            let mut writer = blockwire_codec::Writer::with_pool(BufferPool::new(64));
            records[1].encode(&mut writer);
            partial.extend_from_slice(&writer.to_vec()[..3]);
        }
        let file = write_log(&records, &partial);
        let backend = FileBackend::open(file.path()).unwrap();
        assert_eq!(read_records(&backend, 0, None).unwrap().len(), 3);
    }
}
