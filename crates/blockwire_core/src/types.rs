//! Core type definitions for the transaction log.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a definition: a record kind, an entity type or a field.
///
/// Ids below [`reserved::FIRST_USER_ID`] are reserved for the log's own
/// record kinds and header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DefinitionId(pub u64);

impl DefinitionId {
    /// Creates a new definition id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for ids available to user entity types and fields.
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 >= reserved::FIRST_USER_ID.0
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def:{}", self.0)
    }
}

/// Identifier of an entity within its type.
///
/// Entity ids are assigned sequentially per type, starting at 1, in the
/// order creation records appear in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u64);

impl EntityId {
    /// The first id assigned in every table.
    pub const FIRST: Self = Self(1);

    /// Creates a new entity id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the id assigned after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Creates a timestamp from microseconds since the epoch.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Returns microseconds since the epoch.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Reads the system clock.
    #[must_use]
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));
        Self(micros)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Source of record timestamps.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Returns a clock backed by [`Timestamp::now`].
#[must_use]
pub fn system_clock() -> Clock {
    Arc::new(Timestamp::now)
}

/// Reserved definition ids.
///
/// Record kinds select the replay path for a transaction; header fields
/// carry the log's own bookkeeping inside those transactions.
pub mod reserved {
    use super::DefinitionId;

    /// Log header record carrying the format version.
    pub const TRANSACTION: DefinitionId = DefinitionId(1);
    /// Field definition record.
    pub const FIELD: DefinitionId = DefinitionId(2);
    /// Entity type definition record.
    pub const ENTITY_TYPE: DefinitionId = DefinitionId(3);
    /// Project-level name/value record.
    pub const PROJECT_META: DefinitionId = DefinitionId(4);
    /// Block boundary marker.
    pub const BLOCK_BOUNDARY: DefinitionId = DefinitionId(5);
    /// Field update of an existing entity.
    pub const SET_FIELDS: DefinitionId = DefinitionId(6);
    /// Removal of an existing entity.
    pub const ARCHIVE: DefinitionId = DefinitionId(7);

    /// Record time; ends the header zone of update and archive records.
    pub const TIMESTAMP: DefinitionId = DefinitionId(16);
    /// Target entity of an update or archive.
    pub const ENTITY_ID: DefinitionId = DefinitionId(17);
    /// Target entity type of an update or archive.
    pub const DEFINITION_ID: DefinitionId = DefinitionId(18);
    /// Variant type selected by an update.
    pub const VARIANT_TYPE_ID: DefinitionId = DefinitionId(19);
    /// Id of a declared definition.
    pub const ID: DefinitionId = DefinitionId(20);
    /// Name of a declared definition or project entry.
    pub const NAME: DefinitionId = DefinitionId(21);
    /// Value kind of a declared field.
    pub const VALUE_KIND: DefinitionId = DefinitionId(22);
    /// Nullability of a declared field.
    pub const IS_NULLABLE: DefinitionId = DefinitionId(23);
    /// Whether a definition may appear in instance records.
    pub const CAN_INSTANCE: DefinitionId = DefinitionId(24);
    /// One member field of a declared entity type.
    pub const MEMBER: DefinitionId = DefinitionId(25);
    /// Schema version of a declared entity type.
    pub const VERSION: DefinitionId = DefinitionId(26);
    /// Sequence number of a block boundary.
    pub const BLOCK_NUMBER: DefinitionId = DefinitionId(27);
    /// Format version in the log header.
    pub const FORMAT_VERSION: DefinitionId = DefinitionId(28);
    /// Value of a project entry.
    pub const META_VALUE: DefinitionId = DefinitionId(29);

    /// Lowest id available to user entity types and fields.
    pub const FIRST_USER_ID: DefinitionId = DefinitionId(64);

    /// Returns the name of a reserved id, if it has one.
    #[must_use]
    pub fn name(id: DefinitionId) -> Option<&'static str> {
        let name = match id.0 {
            1 => "Transaction",
            2 => "Field",
            3 => "EntityType",
            4 => "ProjectMeta",
            5 => "BlockBoundary",
            6 => "SetFields",
            7 => "Archive",
            16 => "Timestamp",
            17 => "EntityId",
            18 => "DefinitionId",
            19 => "VariantTypeId",
            20 => "Id",
            21 => "Name",
            22 => "ValueKind",
            23 => "IsNullable",
            24 => "CanInstance",
            25 => "Member",
            26 => "Version",
            27 => "BlockNumber",
            28 => "FormatVersion",
            29 => "MetaValue",
            _ => return None,
        };
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ids_start_at_first_user_id() {
        assert!(!reserved::ARCHIVE.is_user());
        assert!(!DefinitionId(63).is_user());
        assert!(reserved::FIRST_USER_ID.is_user());
    }

    #[test]
    fn entity_ids_advance() {
        assert_eq!(EntityId::FIRST.next(), EntityId(2));
        assert_eq!(EntityId(7).to_string(), "entity:7");
    }

    #[test]
    fn reserved_names() {
        assert_eq!(reserved::name(reserved::SET_FIELDS), Some("SetFields"));
        assert_eq!(reserved::name(reserved::TIMESTAMP), Some("Timestamp"));
        assert_eq!(reserved::name(DefinitionId(64)), None);
    }

    #[test]
    fn system_clock_is_after_epoch() {
        let clock = system_clock();
        assert!(clock().as_micros() > 0);
    }
}
