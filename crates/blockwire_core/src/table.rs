//! In-memory tables rebuilt by replay.

use crate::definition::Definition;
use crate::error::{CoreError, CoreResult};
use crate::meta::TableMeta;
use crate::schema::Schema;
use crate::transaction::Transaction;
use crate::types::{reserved, DefinitionId, EntityId, Timestamp};
use blockwire_codec::Value;
use std::any::Any;
use std::collections::BTreeMap;

/// A Rust type that can live in a table.
pub trait Record: Default + Clone + Send + Sync + 'static {}

impl<T: Default + Clone + Send + Sync + 'static> Record for T {}

/// A stored record and its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<R> {
    /// The record.
    pub record: R,
    /// Timestamp of the creation record.
    pub created: Timestamp,
    /// Timestamp of the last update, or of the creation.
    pub updated: Timestamp,
    /// Variant type named by the last update that carried one.
    pub variant: Option<DefinitionId>,
}

/// All live records of one entity type, keyed by entity id.
///
/// Entity ids are assigned per type in creation order starting at 1. An
/// archived id is never reused.
#[derive(Debug)]
pub struct Table<R> {
    meta: TableMeta<R>,
    records: BTreeMap<EntityId, Entry<R>>,
    next_id: EntityId,
}

impl<R: Record> Table<R> {
    /// Creates an empty table for `meta`.
    #[must_use]
    pub fn new(meta: TableMeta<R>) -> Self {
        Self {
            meta,
            records: BTreeMap::new(),
            next_id: EntityId::FIRST,
        }
    }

    /// Returns the table's meta.
    #[must_use]
    pub fn meta(&self) -> &TableMeta<R> {
        &self.meta
    }

    /// Returns a record.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&R> {
        self.records.get(&id).map(|e| &e.record)
    }

    /// Returns a record with its timestamps.
    #[must_use]
    pub fn entry(&self, id: EntityId) -> Option<&Entry<R>> {
        self.records.get(&id)
    }

    /// Iterates live entity ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.records.keys().copied()
    }

    /// Iterates live records in id order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entry<R>)> {
        self.records.iter().map(|(id, e)| (*id, e))
    }

    /// Returns the number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the table holds no live records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the id the next creation will receive.
    #[must_use]
    pub fn next_id(&self) -> EntityId {
        self.next_id
    }

    fn build(&self, tx: &Transaction, schema: &Schema) -> CoreResult<(R, Timestamp)> {
        let definition = schema.definition(self.meta.id()).ok_or_else(|| {
            CoreError::invalid_record(format!("{} is not declared", self.meta.name()))
        })?;
        if !definition.is_record() || !definition.can_instance {
            return Err(CoreError::invalid_record(format!(
                "{} cannot be instanced",
                definition.name
            )));
        }
        for (field, value) in &tx.fields {
            if *field != reserved::TIMESTAMP {
                check_member(schema, definition, *field, value)?;
            }
        }
        self.meta.read_object(tx)
    }

    /// Applies a change set to a copy of the entry.
    fn prepare_set(
        &self,
        entity: EntityId,
        variant: Option<DefinitionId>,
        changes: &[(DefinitionId, Value)],
        ts: Timestamp,
        schema: &Schema,
    ) -> CoreResult<Entry<R>> {
        let type_id = self.meta.id();
        let owner = schema
            .definition(type_id)
            .ok_or_else(|| CoreError::invalid_record(format!("{type_id} is not declared")))?;
        if let Some(variant) = variant {
            if !schema.definition(variant).is_some_and(Definition::is_record) {
                return Err(CoreError::invalid_record(format!(
                    "variant {variant} is not an entity type"
                )));
            }
        }
        let current = self.records.get(&entity).ok_or(CoreError::EntityNotFound {
            definition: type_id,
            entity,
        })?;

        let mut next = current.clone();
        for (field, value) in changes {
            check_member(schema, owner, *field, value)?;
            self.meta.read_field(&mut next.record, *field, value.clone())?;
        }
        next.updated = ts;
        if variant.is_some() {
            next.variant = variant;
        }
        Ok(next)
    }
}

/// Checks one instance field against the schema.
fn check_member(
    schema: &Schema,
    owner: &Definition,
    field: DefinitionId,
    value: &Value,
) -> CoreResult<()> {
    let definition = schema
        .definition(field)
        .ok_or_else(|| CoreError::invalid_record(format!("unknown field {field}")))?;
    if definition.is_record() || !definition.can_instance {
        return Err(CoreError::invalid_record(format!(
            "{} cannot appear in instance records",
            definition.name
        )));
    }
    if !owner.members.contains(&field) {
        return Err(CoreError::invalid_record(format!(
            "{} is not a member of {}",
            definition.name, owner.name
        )));
    }
    definition.check_value(value)
}

/// Type-erased table, so the log can hold tables of different record types.
pub(crate) trait ErasedTable: Send + Sync {
    fn definition(&self) -> Definition;

    fn field_definitions(&self) -> Vec<Definition>;

    fn name(&self) -> &str;

    /// Applies a creation record; a rejected record consumes no id.
    fn apply_create(&mut self, tx: &Transaction, schema: &Schema) -> CoreResult<EntityId>;

    fn check_create(&self, tx: &Transaction, schema: &Schema) -> CoreResult<()>;

    fn check_set(
        &self,
        entity: EntityId,
        variant: Option<DefinitionId>,
        changes: &[(DefinitionId, Value)],
        schema: &Schema,
    ) -> CoreResult<()>;

    /// Applies a change set to a clone of the entity, then replaces it.
    fn apply_set(
        &mut self,
        entity: EntityId,
        variant: Option<DefinitionId>,
        changes: &[(DefinitionId, Value)],
        ts: Timestamp,
        schema: &Schema,
    ) -> CoreResult<()>;

    fn archive(&mut self, entity: EntityId) -> CoreResult<()>;

    fn contains(&self, entity: EntityId) -> bool;

    fn len(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

impl<R: Record> ErasedTable for Table<R> {
    fn definition(&self) -> Definition {
        self.meta.definition()
    }

    fn field_definitions(&self) -> Vec<Definition> {
        self.meta.field_definitions()
    }

    fn name(&self) -> &str {
        self.meta.name()
    }

    fn apply_create(&mut self, tx: &Transaction, schema: &Schema) -> CoreResult<EntityId> {
        let (record, ts) = self.build(tx, schema)?;
        let id = self.next_id;
        self.next_id = id.next();
        self.records.insert(
            id,
            Entry {
                record,
                created: ts,
                updated: ts,
                variant: None,
            },
        );
        Ok(id)
    }

    fn check_create(&self, tx: &Transaction, schema: &Schema) -> CoreResult<()> {
        self.build(tx, schema).map(drop)
    }

    fn check_set(
        &self,
        entity: EntityId,
        variant: Option<DefinitionId>,
        changes: &[(DefinitionId, Value)],
        schema: &Schema,
    ) -> CoreResult<()> {
        self.prepare_set(entity, variant, changes, Timestamp(0), schema)
            .map(drop)
    }

    fn apply_set(
        &mut self,
        entity: EntityId,
        variant: Option<DefinitionId>,
        changes: &[(DefinitionId, Value)],
        ts: Timestamp,
        schema: &Schema,
    ) -> CoreResult<()> {
        let next = self.prepare_set(entity, variant, changes, ts, schema)?;
        self.records.insert(entity, next);
        Ok(())
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.records.contains_key(&entity)
    }

    fn archive(&mut self, entity: EntityId) -> CoreResult<()> {
        self.records
            .remove(&entity)
            .map(|_| ())
            .ok_or(CoreError::EntityNotFound {
                definition: self.meta.id(),
                entity,
            })
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::{article_meta, Article, ARTICLE, NOTE, TITLE, VIEWS};
    use blockwire_codec::ValueKind;

    fn schema_for(meta: &TableMeta<Article>) -> Schema {
        let mut schema = Schema::new();
        for def in meta.field_definitions() {
            schema.declare(def).unwrap();
        }
        schema.declare(meta.definition()).unwrap();
        schema
    }

    fn creation(title: &str, views: i64) -> Transaction {
        Transaction::new(ARTICLE)
            .with(reserved::TIMESTAMP, 5i64)
            .with(TITLE, title)
            .with(VIEWS, views)
            .with(NOTE, Value::Null)
    }

    #[test]
    fn creation_assigns_sequential_ids() {
        let meta = article_meta();
        let schema = schema_for(&meta);
        let mut table = Table::new(meta);

        assert_eq!(table.apply_create(&creation("a", 1), &schema).unwrap(), EntityId(1));
        assert_eq!(table.apply_create(&creation("b", 2), &schema).unwrap(), EntityId(2));
        assert_eq!(table.get(EntityId(2)).unwrap().title, "b");
        assert_eq!(table.entry(EntityId(1)).unwrap().created, Timestamp(5));
    }

    #[test]
    fn rejected_creation_consumes_no_id() {
        let meta = article_meta();
        let schema = schema_for(&meta);
        let mut table = Table::new(meta);

        let bad = Transaction::new(ARTICLE)
            .with(reserved::TIMESTAMP, 5i64)
            .with(TITLE, Value::Null);
        assert!(table.apply_create(&bad, &schema).is_err());
        assert_eq!(table.next_id(), EntityId(1));
        assert!(table.is_empty());
    }

    #[test]
    fn undeclared_field_rejected() {
        let meta = article_meta();
        let schema = schema_for(&meta);
        let mut table = Table::new(meta);
        let tx = creation("a", 1).with(DefinitionId(90), 1i64);
        assert!(table.apply_create(&tx, &schema).is_err());
    }

    #[test]
    fn schema_known_field_missing_from_meta_is_ignored() {
        let meta = article_meta();
        let mut schema = schema_for(&meta);
        schema
            .declare(Definition::field(DefinitionId(90), "extra", ValueKind::Bool, false))
            .unwrap();
        let mut grown = meta.definition();
        grown.members.push(DefinitionId(90));
        schema.declare(grown).unwrap();

        let mut table = Table::new(meta);
        let tx = creation("a", 1).with(DefinitionId(90), true);
        assert_eq!(table.apply_create(&tx, &schema).unwrap(), EntityId(1));
    }

    #[test]
    fn set_is_all_or_nothing() {
        let meta = article_meta();
        let schema = schema_for(&meta);
        let mut table = Table::new(meta);
        table.apply_create(&creation("a", 1), &schema).unwrap();

        let changes = vec![(VIEWS, Value::Integer(9)), (TITLE, Value::Integer(0))];
        assert!(table
            .apply_set(EntityId(1), None, &changes, Timestamp(6), &schema)
            .is_err());
        assert_eq!(table.get(EntityId(1)).unwrap().views, 1);

        let changes = vec![(VIEWS, Value::Integer(9))];
        table
            .apply_set(EntityId(1), None, &changes, Timestamp(6), &schema)
            .unwrap();
        let entry = table.entry(EntityId(1)).unwrap();
        assert_eq!(entry.record.views, 9);
        assert_eq!(entry.updated, Timestamp(6));
        assert_eq!(entry.created, Timestamp(5));
    }

    #[test]
    fn archive_removes_and_keeps_counter() {
        let meta = article_meta();
        let schema = schema_for(&meta);
        let mut table = Table::new(meta);
        table.apply_create(&creation("a", 1), &schema).unwrap();
        table.archive(EntityId(1)).unwrap();
        assert!(table.archive(EntityId(1)).is_err());
        assert_eq!(table.apply_create(&creation("b", 1), &schema).unwrap(), EntityId(2));
    }

    #[test]
    fn erased_table_downcasts() {
        let erased: Box<dyn ErasedTable> = Box::new(Table::new(article_meta()));
        assert!(erased.as_any().downcast_ref::<Table<Article>>().is_some());
        assert!(erased.as_any().downcast_ref::<Table<String>>().is_none());
        assert_eq!(erased.name(), "Article");
    }
}
