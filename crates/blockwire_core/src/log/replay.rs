//! Replay state machine.
//!
//! Records are dispatched on their leading definition id:
//!
//! | definition id            | handled by                         |
//! |--------------------------|------------------------------------|
//! | `Transaction`, `Field`, `EntityType`, `ProjectMeta`, `BlockBoundary` | [`Schema::apply`] |
//! | `SetFields`              | field update of an existing entity |
//! | `Archive`                | removal of an existing entity      |
//! | user id (64 and up)      | creation of a new entity           |
//!
//! Local writes go through the same [`LogState::apply`] after they are
//! appended, so the in-memory tables always equal a replay of the log.

use super::reader::{ForwardReader, LoggedRecord};
use crate::error::{CoreError, CoreResult};
use crate::schema::Schema;
use crate::table::{ErasedTable, Record, Table};
use crate::transaction::Transaction;
use crate::types::{reserved, DefinitionId, EntityId};
use blockwire_codec::{BufferPool, Value};
use blockwire_storage::StorageBackend;
use serde::Serialize;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use tracing::{debug, warn};

/// A record replay refused to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Offset of the record.
    pub offset: u64,
    /// Leading definition id.
    pub definition: u64,
    /// Why it was refused.
    pub reason: String,
}

/// Summary of one replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Complete records read.
    pub records: u64,
    /// Entities created.
    pub created: u64,
    /// Field updates applied.
    pub updated: u64,
    /// Entities archived.
    pub archived: u64,
    /// Schema records applied.
    pub schema_records: u64,
    /// Instance records of types with no registered table.
    pub unloaded: u64,
    /// Records that were refused.
    pub rejected: Vec<Rejection>,
    /// Offset of an incomplete final record.
    pub torn_tail: Option<u64>,
    /// Offset just past the last complete record.
    pub end_offset: u64,
    /// Blocks loaded from the backend.
    pub blocks_read: u64,
}

impl ReplayReport {
    /// Returns true if every record applied and the log ended cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.torn_tail.is_none()
    }

    fn count(&mut self, applied: &Applied) {
        match applied {
            Applied::Schema => self.schema_records += 1,
            Applied::Created(_) => self.created += 1,
            Applied::Updated => self.updated += 1,
            Applied::Archived => self.archived += 1,
            Applied::Unloaded => self.unloaded += 1,
        }
    }
}

/// What applying one record did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Applied {
    Schema,
    Created(EntityId),
    Updated,
    Archived,
    /// An instance record of a type with no registered table.
    Unloaded,
}

/// Header zone of a `SetFields` or `Archive` record.
struct Target<'a> {
    definition: DefinitionId,
    entity: EntityId,
    variant: Option<DefinitionId>,
    changes: &'a [(DefinitionId, Value)],
}

impl<'a> Target<'a> {
    fn parse(tx: &'a Transaction) -> CoreResult<Self> {
        let (header, changes) = tx.split_header();
        if tx.timestamp().is_none() {
            return Err(CoreError::invalid_record("update without Timestamp"));
        }
        let mut definition = None;
        let mut entity = None;
        let mut variant = None;
        for (field, value) in header {
            let id = value.as_u64().ok_or_else(|| {
                CoreError::invalid_record(format!("{field} must be a non-negative integer"))
            })?;
            match *field {
                reserved::ENTITY_ID => entity = Some(EntityId(id)),
                reserved::DEFINITION_ID => definition = Some(DefinitionId(id)),
                reserved::VARIANT_TYPE_ID => variant = Some(DefinitionId(id)),
                other => {
                    return Err(CoreError::invalid_record(format!(
                        "unexpected {other} before Timestamp"
                    )))
                }
            }
        }
        Ok(Self {
            definition: definition
                .ok_or_else(|| CoreError::invalid_record("update without DefinitionId"))?,
            entity: entity.ok_or_else(|| CoreError::invalid_record("update without EntityId"))?,
            variant,
            changes,
        })
    }
}

/// Schema plus the registered tables.
#[derive(Default)]
pub(crate) struct LogState {
    pub(crate) schema: Schema,
    tables: HashMap<DefinitionId, Box<dyn ErasedTable>>,
    types: HashMap<TypeId, DefinitionId>,
}

impl LogState {
    /// Registers a table. Fails if the type or definition id is taken.
    pub(crate) fn register<R: Record>(&mut self, table: Table<R>) -> CoreResult<()> {
        let id = table.meta().id();
        if !id.is_user() {
            return Err(CoreError::invalid_operation(format!(
                "{} uses reserved {id}",
                table.meta().name()
            )));
        }
        if self.tables.contains_key(&id) || self.types.contains_key(&TypeId::of::<R>()) {
            return Err(CoreError::invalid_operation(format!(
                "{} ({id}) registered twice",
                table.meta().name()
            )));
        }
        self.types.insert(TypeId::of::<R>(), id);
        self.tables.insert(id, Box::new(table));
        Ok(())
    }

    pub(crate) fn tables(&self) -> impl Iterator<Item = &dyn ErasedTable> {
        self.tables.values().map(|t| &**t)
    }

    pub(crate) fn definition_of<R: Record>(&self) -> CoreResult<DefinitionId> {
        self.types
            .get(&TypeId::of::<R>())
            .copied()
            .ok_or(CoreError::UnknownType {
                type_name: type_name::<R>(),
            })
    }

    pub(crate) fn table<R: Record>(&self) -> CoreResult<&Table<R>> {
        let id = self.definition_of::<R>()?;
        self.tables
            .get(&id)
            .and_then(|t| t.as_any().downcast_ref::<Table<R>>())
            .ok_or(CoreError::UnknownType {
                type_name: type_name::<R>(),
            })
    }

    fn table_for(&self, id: DefinitionId) -> CoreResult<Option<&dyn ErasedTable>> {
        match self.tables.get(&id) {
            Some(table) => Ok(Some(&**table)),
            None if self.schema.definition(id).is_some_and(|d| d.is_record()) => Ok(None),
            None => Err(CoreError::invalid_record(format!("unknown entity type {id}"))),
        }
    }

    /// Validates a record without changing anything.
    ///
    /// Only instance records are checked; the log builds its own schema
    /// records and checks them before encoding.
    pub(crate) fn check(&self, tx: &Transaction) -> CoreResult<()> {
        match tx.definition {
            reserved::SET_FIELDS => {
                let target = Target::parse(tx)?;
                if let Some(table) = self.table_for(target.definition)? {
                    table.check_set(target.entity, target.variant, target.changes, &self.schema)?;
                }
                Ok(())
            }
            reserved::ARCHIVE => {
                let target = Target::parse(tx)?;
                if !target.changes.is_empty() {
                    return Err(CoreError::invalid_record("archive carries field changes"));
                }
                match self.table_for(target.definition)? {
                    Some(table) if !table.contains(target.entity) => {
                        Err(CoreError::EntityNotFound {
                            definition: target.definition,
                            entity: target.entity,
                        })
                    }
                    _ => Ok(()),
                }
            }
            id if id.is_user() => match self.table_for(id)? {
                Some(table) => table.check_create(tx, &self.schema),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Applies one record to the schema or a table.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnsupportedFormat`] is fatal; every other error means
    /// the record was rejected and nothing changed.
    pub(crate) fn apply(&mut self, tx: &Transaction) -> CoreResult<Applied> {
        if tx.is_schema() {
            return self.schema.apply(tx).map(|_| Applied::Schema);
        }
        match tx.definition {
            reserved::SET_FIELDS => {
                let target = Target::parse(tx)?;
                let ts = tx
                    .timestamp()
                    .ok_or_else(|| CoreError::invalid_record("update without Timestamp"))?;
                if self.table_for(target.definition)?.is_none() {
                    return Ok(Applied::Unloaded);
                }
                let schema = &self.schema;
                if let Some(table) = self.tables.get_mut(&target.definition) {
                    table.apply_set(target.entity, target.variant, target.changes, ts, schema)?;
                }
                Ok(Applied::Updated)
            }
            reserved::ARCHIVE => {
                let target = Target::parse(tx)?;
                if !target.changes.is_empty() {
                    return Err(CoreError::invalid_record("archive carries field changes"));
                }
                if self.table_for(target.definition)?.is_none() {
                    return Ok(Applied::Unloaded);
                }
                if let Some(table) = self.tables.get_mut(&target.definition) {
                    table.archive(target.entity)?;
                }
                Ok(Applied::Archived)
            }
            id if id.is_user() => {
                if self.table_for(id)?.is_none() {
                    return Ok(Applied::Unloaded);
                }
                let schema = &self.schema;
                let table = self
                    .tables
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::invalid_record(format!("unknown entity type {id}")))?;
                table.apply_create(tx, schema).map(Applied::Created)
            }
            other => Err(CoreError::invalid_record(format!(
                "unknown record kind {other}"
            ))),
        }
    }
}

/// Replays a log into `state`.
///
/// The first record must be the log header. Rejected records are reported
/// and skipped; an incomplete final record ends the replay and is reported
/// as the torn tail.
///
/// # Errors
///
/// Returns [`CoreError::LogCorruption`] for structural damage or a missing
/// header, and [`CoreError::UnsupportedFormat`] for a newer log.
pub(crate) fn replay(
    backend: &dyn StorageBackend,
    pool: BufferPool,
    state: &mut LogState,
) -> CoreResult<ReplayReport> {
    let mut reader = ForwardReader::new(backend, pool)?;
    let mut report = ReplayReport::default();

    while let Some(record) = reader.next_record()? {
        if report.records == 0 && record.transaction.definition != reserved::TRANSACTION {
            return Err(CoreError::log_corruption(
                record.offset,
                "log does not start with a header",
            ));
        }
        report.records += 1;
        record_outcome(&mut report, &record, state.apply(&record.transaction))?;
    }

    report.torn_tail = reader.torn_tail();
    report.end_offset = reader.position();
    report.blocks_read = reader.blocks_read();
    debug!(
        records = report.records,
        created = report.created,
        updated = report.updated,
        archived = report.archived,
        rejected = report.rejected.len(),
        end_offset = report.end_offset,
        "replay finished"
    );
    for table in state.tables() {
        debug!(table = table.name(), live = table.len(), "table replayed");
    }
    Ok(report)
}

fn record_outcome(
    report: &mut ReplayReport,
    record: &LoggedRecord,
    outcome: CoreResult<Applied>,
) -> CoreResult<()> {
    match outcome {
        Ok(applied) => {
            report.count(&applied);
            Ok(())
        }
        Err(e @ CoreError::UnsupportedFormat { .. }) => Err(e),
        Err(e) => {
            warn!(
                offset = record.offset,
                definition = record.transaction.definition.0,
                error = %e,
                "rejected log record"
            );
            report.rejected.push(Rejection {
                offset: record.offset,
                definition: record.transaction.definition.0,
                reason: e.to_string(),
            });
            Ok(())
        }
    }
}

/// Replays a log with no registered tables.
///
/// Instance records are counted as unloaded. Used by tools that inspect a
/// log without knowing its record types.
///
/// # Errors
///
/// Same as a replay on open.
pub fn inspect(backend: &dyn StorageBackend, pool: BufferPool) -> CoreResult<(Schema, ReplayReport)> {
    let mut state = LogState::default();
    let report = replay(backend, pool, &mut state)?;
    Ok((state.schema, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::{article_meta, Article, ARTICLE, TITLE, VIEWS};
    use crate::types::Timestamp;
    use blockwire_codec::Writer;
    use blockwire_storage::InMemoryBackend;

    fn schema_records() -> Vec<Transaction> {
        let meta = article_meta();
        let mut records = vec![Transaction::header(1, Timestamp(0))];
        records.extend(meta.field_definitions().iter().map(|d| d.to_transaction(Timestamp(0))));
        records.push(meta.definition().to_transaction(Timestamp(0)));
        records
    }

    fn create(title: &str, views: i64) -> Transaction {
        Transaction::new(ARTICLE)
            .with(reserved::TIMESTAMP, 1i64)
            .with(TITLE, title)
            .with(VIEWS, views)
    }

    fn backend_of(records: &[Transaction]) -> InMemoryBackend {
        let mut writer = Writer::with_pool(BufferPool::new(64));
        for tx in records {
            tx.encode(&mut writer);
        }
        InMemoryBackend::with_data(writer.to_vec())
    }

    fn state() -> LogState {
        let mut state = LogState::default();
        state.register(Table::new(article_meta())).unwrap();
        state
    }

    #[test]
    fn replays_creations_updates_and_archives() {
        let mut records = schema_records();
        records.push(create("a", 1));
        records.push(create("b", 2));
        records.push(Transaction::set_fields(
            ARTICLE,
            EntityId(1),
            None,
            Timestamp(2),
            vec![(VIEWS, Value::Integer(10))],
        ));
        records.push(Transaction::archive(ARTICLE, EntityId(2), Timestamp(3)));
        let backend = backend_of(&records);

        let mut state = state();
        let report = replay(&backend, BufferPool::new(32), &mut state).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.archived, 1);
        assert_eq!(report.schema_records, 5);

        let table = state.table::<Article>().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(EntityId(1)).unwrap().views, 10);
        assert_eq!(table.entry(EntityId(1)).unwrap().updated, Timestamp(2));
    }

    #[test]
    fn bad_records_are_reported_and_skipped() {
        let mut records = schema_records();
        records.push(create("a", 1));
        records.push(Transaction::archive(ARTICLE, EntityId(9), Timestamp(3)));
        records.push(create("b", 2).with(DefinitionId(99), 1i64));
        records.push(create("c", 3));
        let backend = backend_of(&records);

        let mut state = state();
        let report = replay(&backend, BufferPool::new(32), &mut state).unwrap();
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].definition, reserved::ARCHIVE.0);
        assert_eq!(report.created, 2);

        let table = state.table::<Article>().unwrap();
        assert_eq!(table.get(EntityId(2)).unwrap().title, "c");
    }

    #[test]
    fn missing_header_is_corruption() {
        let backend = backend_of(&[create("a", 1)]);
        let err = replay(&backend, BufferPool::new(32), &mut state()).unwrap_err();
        assert!(matches!(err, CoreError::LogCorruption { offset: 0, .. }));
    }

    #[test]
    fn newer_format_stops_replay() {
        let backend = backend_of(&[Transaction::header(99, Timestamp(0))]);
        let err = replay(&backend, BufferPool::new(32), &mut state()).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedFormat { found: 99, .. }));
    }

    #[test]
    fn unregistered_types_are_unloaded() {
        let mut records = schema_records();
        records.push(create("a", 1));
        records.push(Transaction::archive(ARTICLE, EntityId(1), Timestamp(3)));
        let backend = backend_of(&records);

        let (schema, report) = inspect(&backend, BufferPool::new(32)).unwrap();
        assert_eq!(report.unloaded, 2);
        assert!(report.is_clean());
        assert_eq!(schema.by_name("Article").unwrap().id, ARTICLE);
    }

    #[test]
    fn check_matches_apply() {
        let backend = backend_of(&schema_records());
        let mut state = state();
        replay(&backend, BufferPool::new(32), &mut state).unwrap();

        let good = create("a", 1);
        let bad = create("a", 1).with(TITLE, Value::Integer(1));
        assert!(state.check(&good).is_ok());
        assert!(state.check(&bad).is_err());
        assert!(state.apply(&bad).is_err());
        assert!(state.apply(&good).is_ok());

        let missing = Transaction::archive(ARTICLE, EntityId(5), Timestamp(0));
        assert!(state.check(&missing).is_err());
    }

    #[test]
    fn duplicate_registration_refused() {
        let mut state = state();
        assert!(state.register(Table::new(article_meta())).is_err());
    }
}
