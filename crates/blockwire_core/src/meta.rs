//! Mapping between a Rust record type and its entity type definition.

use crate::definition::{check_value, Definition};
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::{reserved, DefinitionId, Timestamp};
use blockwire_codec::{Value, ValueKind, Writer};
use std::fmt;

/// Reads a decoded value into a record.
pub type ReadFn<R> = fn(&mut R, Value) -> CoreResult<()>;
/// Produces the value of one field of a record.
pub type WriteFn<R> = fn(&R) -> Value;

/// One field of a [`TableMeta`].
pub struct FieldAccessor<R> {
    /// Field definition id.
    pub id: DefinitionId,
    /// Field name.
    pub name: String,
    /// Declared value kind.
    pub kind: ValueKind,
    /// Whether the field accepts `Null`.
    pub nullable: bool,
    /// Read delegate.
    pub read: ReadFn<R>,
    /// Write delegate.
    pub write: WriteFn<R>,
}

impl<R> FieldAccessor<R> {
    /// Returns the field definition this accessor declares.
    #[must_use]
    pub fn definition(&self) -> Definition {
        Definition::field(self.id, self.name.clone(), self.kind, self.nullable)
    }

    /// Checks a value against the field's kind and nullability.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] on mismatch.
    pub fn check(&self, value: &Value) -> CoreResult<()> {
        check_value(&self.name, Some(self.kind), self.nullable, value)
    }
}

impl<R> Clone for FieldAccessor<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            nullable: self.nullable,
            read: self.read,
            write: self.write,
        }
    }
}

impl<R> fmt::Debug for FieldAccessor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("nullable", &self.nullable)
            .finish_non_exhaustive()
    }
}

/// Descriptor for one record type: its definition id, name and fields.
///
/// A meta may only grow: appending fields is a compatible change, anything
/// else conflicts with the schema already in the log.
///
/// # Example
///
/// ```
/// use blockwire_codec::{Value, ValueKind};
/// use blockwire_core::{DefinitionId, TableMeta};
///
/// #[derive(Default, Clone)]
/// struct Tag {
///     label: String,
/// }
///
/// let meta = TableMeta::<Tag>::new(DefinitionId(64), "Tag").field(
///     DefinitionId(65),
///     "label",
///     ValueKind::Text,
///     false,
///     |t, v| {
///         t.label = v.as_str().unwrap_or_default().to_string();
///         Ok(())
///     },
///     |t| Value::from(t.label.as_str()),
/// );
/// assert_eq!(meta.field_count_plus_one(), 2);
/// ```
pub struct TableMeta<R> {
    id: DefinitionId,
    name: String,
    fields: Vec<FieldAccessor<R>>,
}

impl<R> TableMeta<R> {
    /// Creates a meta with no fields.
    #[must_use]
    pub fn new(id: DefinitionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field, builder style.
    #[must_use]
    pub fn field(
        mut self,
        id: DefinitionId,
        name: impl Into<String>,
        kind: ValueKind,
        nullable: bool,
        read: ReadFn<R>,
        write: WriteFn<R>,
    ) -> Self {
        self.add_field(FieldAccessor {
            id,
            name: name.into(),
            kind,
            nullable,
            read,
            write,
        });
        self
    }

    /// Appends a field accessor.
    pub fn add_field(&mut self, accessor: FieldAccessor<R>) {
        self.fields.push(accessor);
    }

    /// Returns the entity type definition id.
    #[must_use]
    pub fn id(&self) -> DefinitionId {
        self.id
    }

    /// Returns the entity type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the field accessors in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldAccessor<R>] {
        &self.fields
    }

    /// Returns the accessor for `field`.
    #[must_use]
    pub fn accessor(&self, field: DefinitionId) -> Option<&FieldAccessor<R>> {
        self.fields.iter().find(|a| a.id == field)
    }

    /// Returns the field count of a creation record: declared fields plus the timestamp.
    #[must_use]
    pub fn field_count_plus_one(&self) -> usize {
        self.fields.len() + 1
    }

    /// Returns the entity type definition.
    #[must_use]
    pub fn definition(&self) -> Definition {
        Definition::record(self.id, self.name.clone(), self.fields.iter().map(|f| f.id).collect())
    }

    /// Returns the field definitions, in declaration order.
    #[must_use]
    pub fn field_definitions(&self) -> Vec<Definition> {
        self.fields.iter().map(FieldAccessor::definition).collect()
    }

    /// Streams the creation record for `record` into `writer`.
    ///
    /// Values are checked against the declared kinds first, so nothing is
    /// written for a record that replay would reject.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] if a write delegate produced a
    /// value of the wrong kind or an illegal `Null`.
    pub fn write_object(&self, record: &R, ts: Timestamp, writer: &mut Writer) -> CoreResult<()> {
        let values = self
            .fields
            .iter()
            .map(|accessor| {
                let value = (accessor.write)(record);
                accessor.check(&value).map(|()| value)
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let count = self.field_count_plus_one() as u64;
        writer.write_compressed(self.id.0);
        writer.write_compressed(count);
        writer.write_compressed(reserved::TIMESTAMP.0);
        writer.write_value(&Value::Integer(ts.0));
        for (accessor, value) in self.fields.iter().zip(&values) {
            writer.write_compressed(accessor.id.0);
            writer.write_value(value);
        }
        writer.write_compressed(count);
        writer.write_compressed(self.id.0);
        Ok(())
    }

    /// Applies one decoded field to `record`.
    ///
    /// Returns false if this meta has no such field.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] if the value has the wrong kind,
    /// or whatever the read delegate returns.
    pub fn read_field(&self, record: &mut R, field: DefinitionId, value: Value) -> CoreResult<bool> {
        let Some(accessor) = self.accessor(field) else {
            return Ok(false);
        };
        accessor.check(&value)?;
        (accessor.read)(record, value)?;
        Ok(true)
    }

    /// Writes every field of `record` as (id, value) pairs.
    #[must_use]
    pub fn values(&self, record: &R) -> Vec<(DefinitionId, Value)> {
        self.fields
            .iter()
            .map(|accessor| (accessor.id, (accessor.write)(record)))
            .collect()
    }

    /// Returns the fields whose written value differs between two records.
    #[must_use]
    pub fn diff(&self, before: &R, after: &R) -> Vec<(DefinitionId, Value)> {
        self.fields
            .iter()
            .filter_map(|accessor| {
                let new = (accessor.write)(after);
                ((accessor.write)(before) != new).then_some((accessor.id, new))
            })
            .collect()
    }
}

impl<R: Default> TableMeta<R> {
    /// Builds a record from a creation transaction.
    ///
    /// Fields this meta does not know are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] if the transaction belongs to
    /// another type, lacks a timestamp, or a field fails its checks.
    pub fn read_object(&self, tx: &Transaction) -> CoreResult<(R, Timestamp)> {
        if tx.definition != self.id {
            return Err(CoreError::invalid_record(format!(
                "{} record read as {}",
                tx.definition, self.name
            )));
        }
        let ts = tx
            .timestamp()
            .ok_or_else(|| CoreError::invalid_record("creation record without Timestamp"))?;
        let mut record = R::default();
        for (field, value) in &tx.fields {
            if *field == reserved::TIMESTAMP {
                continue;
            }
            self.read_field(&mut record, *field, value.clone())?;
        }
        Ok((record, ts))
    }
}

impl<R> Clone for TableMeta<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            fields: self.fields.clone(),
        }
    }
}

impl<R> fmt::Debug for TableMeta<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableMeta")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use blockwire_codec::BufferPool;

    #[derive(Debug, Default, Clone, PartialEq)]
    pub(crate) struct Article {
        pub title: String,
        pub views: i64,
        pub note: Option<String>,
    }

    pub(crate) const ARTICLE: DefinitionId = DefinitionId(64);
    pub(crate) const TITLE: DefinitionId = DefinitionId(65);
    pub(crate) const VIEWS: DefinitionId = DefinitionId(66);
    pub(crate) const NOTE: DefinitionId = DefinitionId(67);

    pub(crate) fn article_meta() -> TableMeta<Article> {
        TableMeta::<Article>::new(ARTICLE, "Article")
            .field(
                TITLE,
                "title",
                ValueKind::Text,
                false,
                |a, v| {
                    a.title = v.as_str().unwrap_or_default().to_string();
                    Ok(())
                },
                |a| Value::from(a.title.as_str()),
            )
            .field(
                VIEWS,
                "views",
                ValueKind::Integer,
                false,
                |a, v| {
                    a.views = v.as_i64().unwrap_or_default();
                    Ok(())
                },
                |a| Value::Integer(a.views),
            )
            .field(
                NOTE,
                "note",
                ValueKind::Text,
                true,
                |a, v| {
                    a.note = v.as_str().map(str::to_string);
                    Ok(())
                },
                |a| Value::from(a.note.clone()),
            )
    }

    #[test]
    fn write_object_layout() {
        let meta = article_meta();
        let article = Article {
            title: "hello".into(),
            views: 3,
            note: None,
        };
        let mut writer = Writer::with_pool(BufferPool::new(16));
        meta.write_object(&article, Timestamp(10), &mut writer).unwrap();

        let tx = Transaction::decode(&mut writer.segment()).unwrap();
        assert_eq!(tx.definition, ARTICLE);
        assert_eq!(tx.fields.len(), meta.field_count_plus_one());
        assert_eq!(tx.fields[0], (reserved::TIMESTAMP, Value::Integer(10)));
        assert_eq!(tx.fields[3], (NOTE, Value::Null));
    }

    #[test]
    fn read_object_restores_record() {
        let meta = article_meta();
        let article = Article {
            title: "t".into(),
            views: -4,
            note: Some("n".into()),
        };
        let mut writer = Writer::with_pool(BufferPool::new(16));
        meta.write_object(&article, Timestamp(7), &mut writer).unwrap();
        let tx = Transaction::decode(&mut writer.segment()).unwrap();

        let (read, ts) = meta.read_object(&tx).unwrap();
        assert_eq!(read, article);
        assert_eq!(ts, Timestamp(7));
    }

    #[test]
    fn write_object_refuses_bad_values() {
        let meta = TableMeta::<Article>::new(ARTICLE, "Article").field(
            TITLE,
            "title",
            ValueKind::Text,
            false,
            |_, _| Ok(()),
            |_| Value::Null,
        );
        let mut writer = Writer::with_pool(BufferPool::new(16));
        assert!(meta
            .write_object(&Article::default(), Timestamp(0), &mut writer)
            .is_err());
        assert!(writer.is_empty());
    }

    #[test]
    fn diff_reports_changed_fields_only() {
        let meta = article_meta();
        let before = Article {
            title: "a".into(),
            views: 1,
            note: None,
        };
        let mut after = before.clone();
        after.views = 2;
        assert_eq!(meta.diff(&before, &after), vec![(VIEWS, Value::Integer(2))]);
        assert!(meta.diff(&before, &before).is_empty());
    }

    #[test]
    fn unknown_field_is_skipped() {
        let meta = article_meta();
        let mut article = Article::default();
        assert!(!meta
            .read_field(&mut article, DefinitionId(99), Value::Integer(1))
            .unwrap());
        assert!(meta
            .read_field(&mut article, VIEWS, Value::from("x"))
            .is_err());
    }

    #[test]
    fn definitions_follow_field_order() {
        let meta = article_meta();
        let def = meta.definition();
        assert_eq!(def.members, vec![TITLE, VIEWS, NOTE]);
        assert_eq!(meta.field_definitions().len(), 3);
    }
}
