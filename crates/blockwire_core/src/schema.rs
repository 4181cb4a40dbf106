//! Forward-only schema parser.
//!
//! The schema is rebuilt on every open from the `Transaction`, `Field`,
//! `EntityType`, `ProjectMeta` and `BlockBoundary` records of the log. It
//! only moves forward: definitions are added, entity types may grow by
//! appending members, and nothing is ever removed.

use crate::config::FORMAT_VERSION;
use crate::definition::{Definition, DefinitionKind};
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::{reserved, DefinitionId};
use blockwire_codec::Value;
use std::collections::{BTreeMap, HashMap};

/// What a schema record changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// The log header was read.
    Header {
        /// Format version in the header.
        format_version: u64,
    },
    /// A new definition was added.
    Declared(DefinitionId),
    /// An entity type gained members.
    Grown(DefinitionId),
    /// A definition was repeated unchanged.
    Unchanged(DefinitionId),
    /// A project entry was set.
    ProjectMeta(String),
    /// A block boundary was passed.
    Block(u64),
}

/// Definitions, project entries and block count recovered from the log.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    definitions: BTreeMap<DefinitionId, Definition>,
    by_name: HashMap<String, DefinitionId>,
    format_version: Option<u64>,
    project_meta: BTreeMap<String, Value>,
    block_count: u64,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the format version from the log header, once read.
    #[must_use]
    pub fn format_version(&self) -> Option<u64> {
        self.format_version
    }

    /// Returns the definition with `id`.
    #[must_use]
    pub fn definition(&self, id: DefinitionId) -> Option<&Definition> {
        self.definitions.get(&id)
    }

    /// Returns the definition called `name`.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Definition> {
        self.by_name.get(name).and_then(|id| self.definitions.get(id))
    }

    /// Iterates every definition in id order.
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.definitions.values()
    }

    /// Returns a project entry.
    #[must_use]
    pub fn project_meta(&self, name: &str) -> Option<&Value> {
        self.project_meta.get(name)
    }

    /// Iterates all project entries.
    pub fn project_entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.project_meta.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of the last block boundary seen.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Returns a printable name for any definition id, reserved or declared.
    #[must_use]
    pub fn name_of(&self, id: DefinitionId) -> String {
        reserved::name(id)
            .map(str::to_string)
            .or_else(|| self.definitions.get(&id).map(|d| d.name.clone()))
            .unwrap_or_else(|| id.to_string())
    }

    /// Applies one schema record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] for malformed or conflicting
    /// records; the caller rejects the record and keeps going.
    /// [`CoreError::UnsupportedFormat`] is fatal.
    pub fn apply(&mut self, tx: &Transaction) -> CoreResult<SchemaChange> {
        match tx.definition {
            reserved::TRANSACTION => self.apply_header(tx),
            reserved::FIELD | reserved::ENTITY_TYPE => {
                let definition = Definition::from_transaction(tx)?;
                self.declare(definition)
            }
            reserved::PROJECT_META => {
                let name = tx
                    .field(reserved::NAME)
                    .and_then(Value::as_str)
                    .ok_or_else(|| CoreError::invalid_record("ProjectMeta without Name"))?
                    .to_string();
                let value = tx.field(reserved::META_VALUE).cloned().unwrap_or_default();
                self.project_meta.insert(name.clone(), value);
                Ok(SchemaChange::ProjectMeta(name))
            }
            reserved::BLOCK_BOUNDARY => {
                let number = tx
                    .field(reserved::BLOCK_NUMBER)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CoreError::invalid_record("BlockBoundary without BlockNumber"))?;
                if number != self.block_count + 1 {
                    return Err(CoreError::invalid_record(format!(
                        "block {number} follows block {}",
                        self.block_count
                    )));
                }
                self.block_count = number;
                Ok(SchemaChange::Block(number))
            }
            other => Err(CoreError::invalid_record(format!(
                "{other} is not a schema record"
            ))),
        }
    }

    fn apply_header(&mut self, tx: &Transaction) -> CoreResult<SchemaChange> {
        if self.format_version.is_some() {
            return Err(CoreError::invalid_record("duplicate log header"));
        }
        let version = tx
            .field(reserved::FORMAT_VERSION)
            .and_then(Value::as_u64)
            .ok_or_else(|| CoreError::invalid_record("log header without FormatVersion"))?;
        if version > FORMAT_VERSION {
            return Err(CoreError::UnsupportedFormat {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        self.format_version = Some(version);
        Ok(SchemaChange::Header {
            format_version: version,
        })
    }

    /// Adds or grows a definition.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] if the definition conflicts with
    /// an existing one or names unknown members.
    pub fn declare(&mut self, definition: Definition) -> CoreResult<SchemaChange> {
        if let Some(owner) = self.by_name.get(&definition.name) {
            if *owner != definition.id {
                return Err(CoreError::invalid_record(format!(
                    "name {} already belongs to {owner}",
                    definition.name
                )));
            }
        }
        if definition.is_record() {
            for member in &definition.members {
                match self.definitions.get(member) {
                    Some(d) if !d.is_record() => {}
                    _ => {
                        return Err(CoreError::invalid_record(format!(
                            "entity type {} lists unknown field {member}",
                            definition.name
                        )))
                    }
                }
            }
        }

        let id = definition.id;
        let change = match self.definitions.get(&id) {
            None => SchemaChange::Declared(id),
            Some(existing) if *existing == definition => return Ok(SchemaChange::Unchanged(id)),
            Some(existing) => {
                if !Self::is_growth(existing, &definition) {
                    return Err(CoreError::invalid_record(format!(
                        "conflicting redefinition of {} ({id})",
                        existing.name
                    )));
                }
                SchemaChange::Grown(id)
            }
        };
        self.by_name.insert(definition.name.clone(), id);
        self.definitions.insert(id, definition);
        Ok(change)
    }

    /// An entity type may only gain members at the end.
    fn is_growth(old: &Definition, new: &Definition) -> bool {
        old.kind == DefinitionKind::Record
            && new.kind == DefinitionKind::Record
            && old.name == new.name
            && old.can_instance == new.can_instance
            && new.members.len() > old.members.len()
            && new.members.starts_with(&old.members)
    }
}
