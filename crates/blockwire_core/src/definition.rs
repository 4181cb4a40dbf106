//! Schema definitions and their log records.

use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::{reserved, DefinitionId, Timestamp};
use blockwire_codec::{Value, ValueKind};

/// What a definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    /// An entity type; its members are field definitions.
    Record,
    /// A field holding values of one kind.
    Field(ValueKind),
}

/// A schema entry for an entity type or a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    /// Definition id, at least [`reserved::FIRST_USER_ID`].
    pub id: DefinitionId,
    /// Unique name.
    pub name: String,
    /// Entity type or field.
    pub kind: DefinitionKind,
    /// Whether a field accepts `Null`. Always false for entity types.
    pub is_nullable: bool,
    /// Whether instance records may carry this definition.
    pub can_instance: bool,
    /// Member fields of an entity type, in declaration order.
    pub members: Vec<DefinitionId>,
}

impl Definition {
    /// Creates a field definition.
    #[must_use]
    pub fn field(id: DefinitionId, name: impl Into<String>, kind: ValueKind, nullable: bool) -> Self {
        Self {
            id,
            name: name.into(),
            kind: DefinitionKind::Field(kind),
            is_nullable: nullable,
            can_instance: true,
            members: Vec::new(),
        }
    }

    /// Creates an entity type definition.
    #[must_use]
    pub fn record(id: DefinitionId, name: impl Into<String>, members: Vec<DefinitionId>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: DefinitionKind::Record,
            is_nullable: false,
            can_instance: true,
            members,
        }
    }

    /// Returns the value kind of a field definition.
    #[must_use]
    pub fn value_kind(&self) -> Option<ValueKind> {
        match self.kind {
            DefinitionKind::Field(kind) => Some(kind),
            DefinitionKind::Record => None,
        }
    }

    /// Returns true for entity types.
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self.kind, DefinitionKind::Record)
    }

    /// Checks a value against this field's kind and nullability.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] on mismatch.
    pub fn check_value(&self, value: &Value) -> CoreResult<()> {
        check_value(&self.name, self.value_kind(), self.is_nullable, value)
    }

    /// Builds the schema record declaring this definition.
    #[must_use]
    pub fn to_transaction(&self, ts: Timestamp) -> Transaction {
        let id = Value::Integer(i64::try_from(self.id.0).unwrap_or(i64::MAX));
        match self.kind {
            DefinitionKind::Field(kind) => Transaction::new(reserved::FIELD)
                .with(reserved::TIMESTAMP, ts.0)
                .with(reserved::ID, id)
                .with(reserved::NAME, self.name.as_str())
                .with(reserved::VALUE_KIND, i64::from(kind.as_u8()))
                .with(reserved::IS_NULLABLE, self.is_nullable)
                .with(reserved::CAN_INSTANCE, self.can_instance),
            DefinitionKind::Record => {
                let mut tx = Transaction::new(reserved::ENTITY_TYPE)
                    .with(reserved::TIMESTAMP, ts.0)
                    .with(reserved::ID, id)
                    .with(reserved::NAME, self.name.as_str())
                    .with(reserved::CAN_INSTANCE, self.can_instance);
                for member in &self.members {
                    tx.push(
                        reserved::MEMBER,
                        i64::try_from(member.0).unwrap_or(i64::MAX),
                    );
                }
                tx
            }
        }
    }

    /// Parses a `Field` or `EntityType` schema record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] if a required field is missing,
    /// has the wrong kind, or the id is reserved.
    pub fn from_transaction(tx: &Transaction) -> CoreResult<Self> {
        let is_field = match tx.definition {
            reserved::FIELD => true,
            reserved::ENTITY_TYPE => false,
            other => {
                return Err(CoreError::invalid_record(format!(
                    "{other} is not a definition record"
                )))
            }
        };

        let mut id = None;
        let mut name = None;
        let mut value_kind = None;
        let mut nullable = false;
        let mut can_instance = true;
        let mut members = Vec::new();

        for (field, value) in &tx.fields {
            match *field {
                reserved::TIMESTAMP | reserved::VERSION => {}
                reserved::ID => id = Some(DefinitionId(required_u64(value, "Id")?)),
                reserved::NAME => {
                    name = Some(
                        value
                            .as_str()
                            .ok_or_else(|| CoreError::invalid_record("Name must be text"))?
                            .to_string(),
                    );
                }
                reserved::VALUE_KIND if is_field => {
                    let code = required_u64(value, "ValueKind")?;
                    let kind = u8::try_from(code)
                        .ok()
                        .and_then(ValueKind::from_u8)
                        .ok_or_else(|| {
                            CoreError::invalid_record(format!("unknown value kind {code}"))
                        })?;
                    value_kind = Some(kind);
                }
                reserved::IS_NULLABLE if is_field => nullable = required_bool(value, "IsNullable")?,
                reserved::CAN_INSTANCE => can_instance = required_bool(value, "CanInstance")?,
                reserved::MEMBER if !is_field => {
                    members.push(DefinitionId(required_u64(value, "Member")?));
                }
                other => {
                    return Err(CoreError::invalid_record(format!(
                        "unexpected {} in {} record",
                        reserved::name(other).map_or_else(|| other.to_string(), str::to_string),
                        reserved::name(tx.definition).unwrap_or("definition"),
                    )))
                }
            }
        }

        let id = id.ok_or_else(|| CoreError::invalid_record("definition without Id"))?;
        if !id.is_user() {
            return Err(CoreError::invalid_record(format!(
                "{id} is reserved and cannot be declared"
            )));
        }
        let name = name.ok_or_else(|| CoreError::invalid_record("definition without Name"))?;
        let kind = if is_field {
            DefinitionKind::Field(
                value_kind.ok_or_else(|| CoreError::invalid_record("field without ValueKind"))?,
            )
        } else {
            DefinitionKind::Record
        };

        Ok(Self {
            id,
            name,
            kind,
            is_nullable: nullable,
            can_instance,
            members,
        })
    }
}

/// Checks a value against a declared kind and nullability.
pub(crate) fn check_value(
    name: &str,
    kind: Option<ValueKind>,
    nullable: bool,
    value: &Value,
) -> CoreResult<()> {
    match value.kind() {
        None if nullable => Ok(()),
        None => Err(CoreError::invalid_record(format!(
            "field {name} is not nullable"
        ))),
        Some(actual) if Some(actual) == kind => Ok(()),
        Some(actual) => Err(CoreError::invalid_record(format!(
            "field {name} expects {}, got {}",
            kind.map_or("no value", ValueKind::name),
            actual.name()
        ))),
    }
}

fn required_u64(value: &Value, what: &str) -> CoreResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| CoreError::invalid_record(format!("{what} must be a non-negative integer")))
}

fn required_bool(value: &Value, what: &str) -> CoreResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| CoreError::invalid_record(format!("{what} must be a boolean")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_record_roundtrip() {
        let def = Definition::field(DefinitionId(65), "title", ValueKind::Text, true);
        let tx = def.to_transaction(Timestamp(1));
        assert_eq!(tx.definition, reserved::FIELD);
        assert_eq!(Definition::from_transaction(&tx).unwrap(), def);
    }

    #[test]
    fn entity_type_record_roundtrip() {
        let def = Definition::record(
            DefinitionId(64),
            "Article",
            vec![DefinitionId(65), DefinitionId(66)],
        );
        let tx = def.to_transaction(Timestamp(1));
        assert_eq!(tx.definition, reserved::ENTITY_TYPE);
        assert_eq!(Definition::from_transaction(&tx).unwrap(), def);
    }

    #[test]
    fn reserved_id_cannot_be_declared() {
        let def = Definition::field(DefinitionId(20), "sneaky", ValueKind::Bool, false);
        let err = Definition::from_transaction(&def.to_transaction(Timestamp(0))).unwrap_err();
        assert!(matches!(err, CoreError::InvalidRecord { .. }));
    }

    #[test]
    fn field_without_kind_rejected() {
        let tx = Transaction::new(reserved::FIELD)
            .with(reserved::ID, 70i64)
            .with(reserved::NAME, "x");
        assert!(Definition::from_transaction(&tx).is_err());
    }

    #[test]
    fn member_in_field_record_rejected() {
        let tx = Definition::field(DefinitionId(70), "x", ValueKind::Integer, false)
            .to_transaction(Timestamp(0))
            .with(reserved::MEMBER, 71i64);
        assert!(Definition::from_transaction(&tx).is_err());
    }

    #[test]
    fn value_checks() {
        let def = Definition::field(DefinitionId(70), "count", ValueKind::Integer, false);
        assert!(def.check_value(&Value::Integer(3)).is_ok());
        assert!(def.check_value(&Value::Null).is_err());
        assert!(def.check_value(&Value::Text("3".into())).is_err());

        let nullable = Definition::field(DefinitionId(71), "note", ValueKind::Text, true);
        assert!(nullable.check_value(&Value::Null).is_ok());
    }
}
