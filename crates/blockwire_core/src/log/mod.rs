//! The block chain: an append-only, schema-driven transaction log.
//!
//! # Layout
//!
//! ```text
//! | header | Field* | EntityType* | record | record | BlockBoundary | record | ...
//! ```
//!
//! The log is a plain sequence of [`Transaction`]s. There is no index and
//! no checksum; sentinels at both ends of every record let it be walked in
//! either direction.
//!
//! # Writes
//!
//! Every write encodes one record into a chain of pooled blocks, checks it
//! against the current state, appends it in a single vectored call and then
//! applies it through the replay path. All of this happens under one lock,
//! so there is exactly one writer and readers never see a half-applied
//! record.

mod reader;
mod replay;

pub use reader::{BackwardReader, ForwardReader, LoggedRecord};
pub use replay::{inspect, Rejection, ReplayReport};

use crate::config::ChainConfig;
use crate::definition::Definition;
use crate::error::{CoreError, CoreResult};
use crate::meta::TableMeta;
use crate::schema::Schema;
use crate::table::{Entry, Record, Table};
use crate::transaction::Transaction;
use crate::types::{reserved, system_clock, Clock, DefinitionId, EntityId};
use blockwire_codec::{BufferPool, Chain, Value, Writer};
use blockwire_storage::{FileBackend, StorageBackend};
use parking_lot::Mutex;
use replay::{Applied, LogState};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Result of [`BlockChain::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Records found in both directions.
    pub records: u64,
    /// Offset just past the last complete record.
    pub end_offset: u64,
    /// Incomplete bytes after the last record.
    pub torn_tail: Option<u64>,
}

/// Checks that forward and backward scans find the same record boundaries.
///
/// # Errors
///
/// Returns [`CoreError::LogCorruption`] at the first disagreement or for
/// structural damage found by either scan.
pub fn verify_log(backend: &dyn StorageBackend, pool: &BufferPool) -> CoreResult<VerifyReport> {
    let mut forward = ForwardReader::new(backend, pool.clone())?;
    let mut boundaries = Vec::new();
    while let Some(record) = forward.next_record()? {
        boundaries.push((record.offset, record.len));
    }
    let end_offset = forward.position();
    if let Some(offset) = forward.torn_tail() {
        confirm_torn_tail(backend, pool, offset)?;
    }

    let mut count = 0u64;
    for record in BackwardReader::new(backend, pool.clone(), end_offset) {
        let record = record?;
        let expected = boundaries.pop();
        if expected != Some((record.offset, record.len)) {
            return Err(CoreError::log_corruption(
                record.offset,
                format!(
                    "backward scan found a {} byte record, forward scan expected {expected:?}",
                    record.len
                ),
            ));
        }
        count += 1;
    }
    if let Some((offset, _)) = boundaries.pop() {
        return Err(CoreError::log_corruption(
            offset,
            "record not reached by backward scan",
        ));
    }

    Ok(VerifyReport {
        records: count,
        end_offset,
        torn_tail: forward.torn_tail(),
    })
}

/// Builder for [`BlockChain`].
pub struct BlockChainBuilder {
    config: ChainConfig,
    state: LogState,
    error: Option<CoreError>,
    clock: Clock,
}

impl BlockChainBuilder {
    /// Registers the table for one record type.
    ///
    /// A type or definition id registered twice makes [`open`](Self::open)
    /// fail.
    #[must_use]
    pub fn register<R: Record>(mut self, meta: TableMeta<R>) -> Self {
        if let Err(e) = self.state.register(Table::new(meta)) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Replaces the clock used to timestamp records.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Opens a log file, creating it if needed.
    ///
    /// The file is locked exclusively for the lifetime of the chain.
    ///
    /// # Errors
    ///
    /// Returns [`blockwire_storage::StorageError::Locked`] (wrapped) if
    /// another handle holds the file, plus everything
    /// [`open`](Self::open) returns.
    pub fn open_path(self, path: impl AsRef<Path>) -> CoreResult<BlockChain> {
        let backend = FileBackend::open_with_create_dirs(path.as_ref())?;
        self.open(backend)
    }

    /// Replays `backend` and declares the registered tables.
    ///
    /// # Errors
    ///
    /// Returns an error if replay hits structural corruption, the log is a
    /// newer format, or a registered table conflicts with the stored schema.
    pub fn open<B: StorageBackend + 'static>(self, backend: B) -> CoreResult<BlockChain> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let pool = BufferPool::new(self.config.block_size);
        let mut backend: Box<dyn StorageBackend> = Box::new(backend);

        if backend.size()? == 0 {
            let header = Transaction::header(self.config.format_version, (self.clock)());
            let chain = header.to_chain(&pool);
            append_chain(&mut *backend, &chain)?;
            backend.sync()?;
            debug!(format_version = self.config.format_version, "wrote log header");
        }

        let mut state = self.state;
        let report = replay::replay(&*backend, pool.clone(), &mut state)?;

        let mut torn_tail = None;
        if let Some(offset) = report.torn_tail {
            confirm_torn_tail(&*backend, &pool, offset)?;
            if self.config.repair_torn_tail {
                warn!(offset, "truncating torn log tail");
                backend.truncate(offset)?;
                backend.sync()?;
            } else {
                warn!(offset, "log has a torn tail; opened read-only");
                torn_tail = Some(offset);
            }
        }

        let inner = Inner {
            end: report.end_offset,
            backend,
            state,
            records_since_block: 0,
            torn_tail,
        };
        let chain = BlockChain {
            config: self.config,
            pool,
            clock: self.clock,
            inner: Mutex::new(inner),
            report,
        };
        chain.declare_tables()?;
        info!(
            records = chain.report.records,
            end_offset = chain.report.end_offset,
            "opened block chain"
        );
        Ok(chain)
    }
}

struct Inner {
    backend: Box<dyn StorageBackend>,
    state: LogState,
    /// Offset just past the last complete record.
    end: u64,
    records_since_block: u64,
    /// Set when a torn tail was left in place; writes are refused.
    torn_tail: Option<u64>,
}

/// An open transaction log with its replayed tables.
///
/// # Example
///
/// ```
/// use blockwire_codec::{Value, ValueKind};
/// use blockwire_core::{BlockChain, ChainConfig, DefinitionId, TableMeta};
/// use blockwire_storage::InMemoryBackend;
///
/// #[derive(Debug, Default, Clone, PartialEq)]
/// struct Page {
///     slug: String,
/// }
///
/// let meta = TableMeta::<Page>::new(DefinitionId(64), "Page").field(
///     DefinitionId(65),
///     "slug",
///     ValueKind::Text,
///     false,
///     |p, v| {
///         p.slug = v.as_str().unwrap_or_default().to_string();
///         Ok(())
///     },
///     |p| Value::from(p.slug.as_str()),
/// );
///
/// let log = BlockChain::builder(ChainConfig::default())
///     .register(meta)
///     .open(InMemoryBackend::new())
///     .unwrap();
/// let id = log.create(&Page { slug: "home".into() }).unwrap();
/// assert_eq!(log.get::<Page>(id).unwrap().unwrap().slug, "home");
/// ```
pub struct BlockChain {
    config: ChainConfig,
    pool: BufferPool,
    clock: Clock,
    inner: Mutex<Inner>,
    report: ReplayReport,
}

impl BlockChain {
    /// Starts building a chain.
    #[must_use]
    pub fn builder(config: ChainConfig) -> BlockChainBuilder {
        BlockChainBuilder {
            config,
            state: LogState::default(),
            error: None,
            clock: system_clock(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Returns the pool records are encoded into.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Returns the report of the replay done on open.
    #[must_use]
    pub fn report(&self) -> &ReplayReport {
        &self.report
    }

    /// Returns true if a torn tail was left in place and writes are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().torn_tail.is_some()
    }

    /// Declares every registered field and entity type missing from the log.
    fn declare_tables(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let mut pending = Vec::new();
        for table in inner.state.tables() {
            for field in table.field_definitions() {
                if !pending.contains(&field) && needs_declaration(&inner.state.schema, &field)? {
                    pending.push(field);
                }
            }
            let definition = table.definition();
            if needs_declaration(&inner.state.schema, &definition)? {
                pending.push(definition);
            }
        }
        // field definitions must precede the entity types that list them
        pending.sort_by_key(Definition::is_record);
        for definition in pending {
            debug!(id = definition.id.0, name = %definition.name, "declaring definition");
            let tx = definition.to_transaction((self.clock)());
            self.commit(&mut inner, &tx.to_chain(&self.pool))?;
        }
        Ok(())
    }

    /// Checks, appends and applies one encoded record.
    fn commit(&self, inner: &mut Inner, chain: &Chain) -> CoreResult<Applied> {
        if let Some(offset) = inner.torn_tail {
            return Err(CoreError::TornTail { offset });
        }
        let tx = Transaction::decode(&mut chain.segment())?;
        inner.state.check(&tx)?;

        let written = append_chain(&mut *inner.backend, chain).and_then(|offset| {
            if self.config.sync_on_append {
                inner.backend.sync()?;
            }
            Ok(offset)
        });
        let offset = match written {
            Ok(offset) => offset,
            Err(e) => {
                roll_back(inner);
                return Err(e);
            }
        };
        inner.end = offset + chain.len() as u64;
        let applied = inner.state.apply(&tx)?;

        if !tx.is_schema() {
            inner.records_since_block += 1;
            if self.config.records_per_block > 0
                && inner.records_since_block >= self.config.records_per_block
            {
                self.append_boundary(inner)?;
            }
        }
        Ok(applied)
    }

    fn append_boundary(&self, inner: &mut Inner) -> CoreResult<u64> {
        let number = inner.state.schema.block_count() + 1;
        let tx = Transaction::block_boundary(number, (self.clock)());
        self.commit(inner, &tx.to_chain(&self.pool))?;
        inner.records_since_block = 0;
        Ok(number)
    }

    /// Appends a new record and returns its entity id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownType`] if `R` is not registered,
    /// [`CoreError::InvalidRecord`] if a field value does not match its
    /// definition, or a storage error.
    pub fn create<R: Record>(&self, record: &R) -> CoreResult<EntityId> {
        let mut inner = self.inner.lock();
        let table = inner.state.table::<R>()?;
        let mut writer = Writer::with_pool(self.pool.clone());
        table.meta().write_object(record, (self.clock)(), &mut writer)?;
        match self.commit(&mut inner, writer.chain())? {
            Applied::Created(entity) => Ok(entity),
            other => Err(CoreError::invalid_operation(format!(
                "creation applied as {other:?}"
            ))),
        }
    }

    /// Writes a field update of an existing entity.
    ///
    /// The changes are applied atomically: if one fails its checks nothing
    /// is written.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] for an unknown id and
    /// [`CoreError::InvalidRecord`] for a bad change.
    pub fn set_fields<R: Record>(
        &self,
        id: EntityId,
        changes: Vec<(DefinitionId, Value)>,
    ) -> CoreResult<()> {
        self.write_set::<R>(id, None, changes)
    }

    /// Writes a field update that also records the entity's variant type.
    ///
    /// # Errors
    ///
    /// Same as [`set_fields`](Self::set_fields); the variant must be a
    /// declared entity type.
    pub fn set_variant_fields<R: Record>(
        &self,
        id: EntityId,
        variant: DefinitionId,
        changes: Vec<(DefinitionId, Value)>,
    ) -> CoreResult<()> {
        self.write_set::<R>(id, Some(variant), changes)
    }

    fn write_set<R: Record>(
        &self,
        id: EntityId,
        variant: Option<DefinitionId>,
        changes: Vec<(DefinitionId, Value)>,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let definition = inner.state.definition_of::<R>()?;
        let tx = Transaction::set_fields(definition, id, variant, (self.clock)(), changes);
        self.commit(&mut inner, &tx.to_chain(&self.pool))?;
        Ok(())
    }

    /// Edits a record in place and writes the fields that changed.
    ///
    /// Returns false, writing nothing, if the closure changed no field.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] for an unknown id, or whatever
    /// [`set_fields`](Self::set_fields) returns.
    pub fn update<R: Record>(&self, id: EntityId, edit: impl FnOnce(&mut R)) -> CoreResult<bool> {
        let mut inner = self.inner.lock();
        let table = inner.state.table::<R>()?;
        let before = table.get(id).ok_or(CoreError::EntityNotFound {
            definition: table.meta().id(),
            entity: id,
        })?;
        let mut after = before.clone();
        edit(&mut after);
        let changes = table.meta().diff(before, &after);
        if changes.is_empty() {
            return Ok(false);
        }
        let tx = Transaction::set_fields(table.meta().id(), id, None, (self.clock)(), changes);
        self.commit(&mut inner, &tx.to_chain(&self.pool))?;
        Ok(true)
    }

    /// Removes an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntityNotFound`] for an unknown id.
    pub fn archive<R: Record>(&self, id: EntityId) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let definition = inner.state.definition_of::<R>()?;
        let tx = Transaction::archive(definition, id, (self.clock)());
        self.commit(&mut inner, &tx.to_chain(&self.pool))?;
        Ok(())
    }

    /// Returns a copy of a record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownType`] if `R` is not registered.
    pub fn get<R: Record>(&self, id: EntityId) -> CoreResult<Option<R>> {
        self.with_table(|table: &Table<R>| table.get(id).cloned())
    }

    /// Returns a copy of a record with its timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownType`] if `R` is not registered.
    pub fn entry<R: Record>(&self, id: EntityId) -> CoreResult<Option<Entry<R>>> {
        self.with_table(|table: &Table<R>| table.entry(id).cloned())
    }

    /// Returns the live entity ids of `R` in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownType`] if `R` is not registered.
    pub fn ids<R: Record>(&self) -> CoreResult<Vec<EntityId>> {
        self.with_table(|table: &Table<R>| table.ids().collect())
    }

    /// Returns the number of live records of `R`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownType`] if `R` is not registered.
    pub fn len<R: Record>(&self) -> CoreResult<usize> {
        self.with_table(|table: &Table<R>| table.len())
    }

    /// Runs `f` against the table of `R` while holding the log lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownType`] if `R` is not registered.
    pub fn with_table<R: Record, T>(&self, f: impl FnOnce(&Table<R>) -> T) -> CoreResult<T> {
        let inner = self.inner.lock();
        Ok(f(inner.state.table::<R>()?))
    }

    /// Appends a block boundary and returns its number.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or [`CoreError::TornTail`] if read-only.
    pub fn mark_block_boundary(&self) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        self.append_boundary(&mut inner)
    }

    /// Sets a project-wide entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or [`CoreError::TornTail`] if read-only.
    pub fn set_project_meta(&self, name: &str, value: impl Into<Value>) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let tx = Transaction::project_meta(name, value.into(), (self.clock)());
        self.commit(&mut inner, &tx.to_chain(&self.pool))?;
        Ok(())
    }

    /// Returns a project-wide entry.
    #[must_use]
    pub fn project_meta(&self, name: &str) -> Option<Value> {
        self.inner.lock().state.schema.project_meta(name).cloned()
    }

    /// Returns a snapshot of the schema.
    #[must_use]
    pub fn schema(&self) -> Schema {
        self.inner.lock().state.schema.clone()
    }

    /// Finds the newest `SetFields` or `Archive` record touching an entity.
    ///
    /// Walks the log backward from the end, so recent changes are found
    /// without reading the whole log.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownType`] if `R` is not registered, or
    /// corruption found while scanning.
    pub fn latest_update<R: Record>(&self, id: EntityId) -> CoreResult<Option<LoggedRecord>> {
        let inner = self.inner.lock();
        let definition = inner.state.definition_of::<R>()?;
        for record in BackwardReader::new(&*inner.backend, self.pool.clone(), inner.end) {
            let record = record?;
            let tx = &record.transaction;
            if matches!(tx.definition, reserved::SET_FIELDS | reserved::ARCHIVE)
                && tx.target() == Some((definition, id))
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Returns the last `n` records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns corruption found while scanning.
    pub fn tail(&self, n: usize) -> CoreResult<Vec<LoggedRecord>> {
        let inner = self.inner.lock();
        let mut records = BackwardReader::new(&*inner.backend, self.pool.clone(), inner.end)
            .take(n)
            .collect::<CoreResult<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    /// Calls `f` for every record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns corruption found while scanning, or the first error `f`
    /// returns.
    pub fn scan(&self, mut f: impl FnMut(&LoggedRecord) -> CoreResult<()>) -> CoreResult<()> {
        let inner = self.inner.lock();
        let mut reader = ForwardReader::new(&*inner.backend, self.pool.clone())?;
        while let Some(record) = reader.next_record()? {
            f(&record)?;
        }
        Ok(())
    }

    /// Checks that forward and backward scans agree.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogCorruption`] on disagreement.
    pub fn verify(&self) -> CoreResult<VerifyReport> {
        let inner = self.inner.lock();
        verify_log(&*inner.backend, &self.pool)
    }

    /// Returns the log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.inner.lock().backend.size()?)
    }

    /// Syncs the backend to durable storage.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn sync(&self) -> CoreResult<()> {
        Ok(self.inner.lock().backend.sync()?)
    }
}

impl std::fmt::Debug for BlockChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockChain")
            .field("config", &self.config)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

/// Appends a chain in one call and returns its offset.
/// Cuts a failed append back to the last applied record so a later replay
/// sees exactly what the tables hold. If that fails too, the tail is left
/// for the next open to repair and writes are refused.
fn roll_back(inner: &mut Inner) {
    let end = inner.end;
    let result = match inner.backend.size() {
        Ok(size) if size > end => inner.backend.truncate(end),
        Ok(_) => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(offset = end, error = %e, "cannot roll back failed append; refusing writes");
        inner.torn_tail = Some(end);
    }
}

/// An incomplete record at `offset` is a torn tail only if no complete
/// record can be read backward from the end of the log. A damaged record
/// in the middle of the log is corruption.
fn confirm_torn_tail(backend: &dyn StorageBackend, pool: &BufferPool, offset: u64) -> CoreResult<()> {
    let size = backend.size()?;
    match BackwardReader::new(backend, pool.clone(), size).next_record() {
        Ok(Some(record)) if record.offset > offset => Err(CoreError::log_corruption(
            offset,
            format!(
                "unreadable record is followed by a complete {} byte record at offset {}",
                record.len, record.offset
            ),
        )),
        Err(err @ CoreError::Storage(_)) => Err(err),
        Ok(_) | Err(_) => Ok(()),
    }
}

fn append_chain(backend: &mut dyn StorageBackend, chain: &Chain) -> CoreResult<u64> {
    let parts: Vec<&[u8]> = chain.slices().collect();
    Ok(backend.append_vectored(&parts)?)
}

/// Returns true if `definition` is missing from the schema or grew.
fn needs_declaration(schema: &Schema, definition: &Definition) -> CoreResult<bool> {
    let Some(stored) = schema.definition(definition.id) else {
        if let Some(owner) = schema.by_name(&definition.name) {
            return Err(CoreError::schema_conflict(format!(
                "name {} already belongs to {}",
                definition.name, owner.id
            )));
        }
        return Ok(true);
    };
    if stored == definition {
        return Ok(false);
    }
    let same_shape = stored.kind == definition.kind
        && stored.name == definition.name
        && stored.can_instance == definition.can_instance
        && stored.is_nullable == definition.is_nullable;
    if same_shape && definition.is_record() {
        if definition.members.len() > stored.members.len()
            && definition.members.starts_with(&stored.members)
        {
            return Ok(true);
        }
        // an older binary may register fewer fields than the log knows
        if stored.members.starts_with(&definition.members) {
            return Ok(false);
        }
    }
    Err(CoreError::schema_conflict(format!(
        "{} ({}) differs from the definition stored in the log",
        definition.name, definition.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::{article_meta, Article, ARTICLE, NOTE, TITLE, VIEWS};
    use crate::types::Timestamp;
    use blockwire_codec::ValueKind;
    use blockwire_storage::InMemoryBackend;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn ticking_clock() -> Clock {
        let now = Arc::new(AtomicI64::new(1_000));
        Arc::new(move || Timestamp(now.fetch_add(1, Ordering::Relaxed)))
    }

    fn open(backend: InMemoryBackend) -> BlockChain {
        BlockChain::builder(ChainConfig::default().sync_on_append(false))
            .register(article_meta())
            .with_clock(ticking_clock())
            .open(backend)
            .unwrap()
    }

    fn article(title: &str, views: i64) -> Article {
        Article {
            title: title.into(),
            views,
            note: None,
        }
    }

    #[test]
    fn empty_log_gets_header_and_declarations() {
        let backend = InMemoryBackend::new();
        let log = open(backend.clone());
        let schema = log.schema();
        assert_eq!(schema.format_version(), Some(1));
        assert!(schema.definition(ARTICLE).is_some());
        assert_eq!(schema.by_name("views").unwrap().id, VIEWS);
        // header + three fields + one entity type
        assert_eq!(log.tail(10).unwrap().len(), 5);
        assert!(!backend.data().is_empty());
    }

    #[test]
    fn reopen_restores_state() {
        let backend = InMemoryBackend::new();
        {
            let log = open(backend.clone());
            let a = log.create(&article("a", 1)).unwrap();
            let b = log.create(&article("b", 2)).unwrap();
            log.set_fields::<Article>(a, vec![(VIEWS, Value::Integer(5))]).unwrap();
            log.archive::<Article>(b).unwrap();
        }
        let size = backend.data().len();
        let log = open(backend.clone());
        assert_eq!(backend.data().len(), size, "reopen writes nothing");
        assert_eq!(log.ids::<Article>().unwrap(), vec![EntityId(1)]);
        assert_eq!(log.get::<Article>(EntityId(1)).unwrap().unwrap().views, 5);
        assert_eq!(log.report().created, 2);
        assert!(log.report().is_clean());
        assert_eq!(log.create(&article("c", 0)).unwrap(), EntityId(3));
    }

    #[test]
    fn update_writes_only_changes() {
        let log = open(InMemoryBackend::new());
        let id = log.create(&article("a", 1)).unwrap();
        let size = log.size().unwrap();

        assert!(!log.update::<Article>(id, |_| {}).unwrap());
        assert_eq!(log.size().unwrap(), size);

        assert!(log.update::<Article>(id, |a| a.note = Some("n".into())).unwrap());
        let latest = log.latest_update::<Article>(id).unwrap().unwrap();
        let (_, changes) = latest.transaction.split_header();
        assert_eq!(changes, &[(NOTE, Value::from("n"))]);
    }

    #[test]
    fn invalid_writes_leave_log_untouched() {
        let log = open(InMemoryBackend::new());
        let id = log.create(&article("a", 1)).unwrap();
        let size = log.size().unwrap();

        assert!(log
            .set_fields::<Article>(id, vec![(VIEWS, Value::Integer(2)), (TITLE, Value::Null)])
            .is_err());
        assert!(log.archive::<Article>(EntityId(9)).is_err());
        assert!(log.create(&String::new()).is_err());
        assert_eq!(log.size().unwrap(), size);
        assert_eq!(log.get::<Article>(id).unwrap().unwrap().views, 1);
    }

    #[test]
    fn automatic_block_boundaries() {
        let log = BlockChain::builder(ChainConfig::default().sync_on_append(false).records_per_block(2))
            .register(article_meta())
            .open(InMemoryBackend::new())
            .unwrap();
        for i in 0..5 {
            log.create(&article("x", i)).unwrap();
        }
        assert_eq!(log.schema().block_count(), 2);
        assert_eq!(log.mark_block_boundary().unwrap(), 3);
    }

    #[test]
    fn project_meta_roundtrip() {
        let backend = InMemoryBackend::new();
        open(backend.clone()).set_project_meta("owner", "ops").unwrap();
        assert_eq!(open(backend).project_meta("owner"), Some(Value::from("ops")));
    }

    #[test]
    fn grown_meta_appends_entity_type() {
        let backend = InMemoryBackend::new();
        open(backend.clone()).create(&article("a", 1)).unwrap();

        let grown = article_meta().field(
            DefinitionId(68),
            "pinned",
            ValueKind::Bool,
            true,
            |_, _| Ok(()),
            |_| Value::Null,
        );
        let log = BlockChain::builder(ChainConfig::default())
            .register(grown)
            .open(backend.clone())
            .unwrap();
        assert_eq!(log.schema().definition(ARTICLE).unwrap().members.len(), 4);

        // the older meta still opens the grown log
        let old = open(backend);
        assert_eq!(old.len::<Article>().unwrap(), 1);
    }

    #[test]
    fn conflicting_meta_is_refused() {
        let backend = InMemoryBackend::new();
        drop(open(backend.clone()));

        let changed = TableMeta::<Article>::new(ARTICLE, "Article").field(
            TITLE,
            "title",
            ValueKind::Integer,
            false,
            |_, _| Ok(()),
            |_| Value::Integer(0),
        );
        let err = BlockChain::builder(ChainConfig::default())
            .register(changed)
            .open(backend)
            .unwrap_err();
        assert!(matches!(err, CoreError::SchemaConflict { .. }));
    }

    #[test]
    fn duplicate_registration_fails_open() {
        let err = BlockChain::builder(ChainConfig::default())
            .register(article_meta())
            .register(article_meta())
            .open(InMemoryBackend::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn verify_and_tail_agree_with_scan() {
        let log = open(InMemoryBackend::new());
        for i in 0..20 {
            log.create(&article("t", i)).unwrap();
        }
        let report = log.verify().unwrap();
        let mut scanned = Vec::new();
        log.scan(|r| {
            scanned.push(r.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(report.records as usize, scanned.len());
        assert_eq!(log.tail(3).unwrap(), scanned[scanned.len() - 3..].to_vec());
    }

    #[test]
    fn variant_is_recorded() {
        let log = open(InMemoryBackend::new());
        let id = log.create(&article("a", 1)).unwrap();
        log.set_variant_fields::<Article>(id, ARTICLE, vec![]).unwrap();
        assert_eq!(log.entry::<Article>(id).unwrap().unwrap().variant, Some(ARTICLE));
        assert!(log
            .set_variant_fields::<Article>(id, VIEWS, vec![])
            .is_err());
    }
}
