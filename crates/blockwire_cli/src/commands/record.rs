//! Printable form of a logged record.

use blockwire_codec::Value;
use blockwire_core::{LoggedRecord, Schema};
use serde::Serialize;

/// One record, with definition ids resolved to names.
#[derive(Debug, Serialize)]
pub struct RecordView {
    /// Offset in the log file.
    pub offset: u64,
    /// Encoded size in bytes.
    pub len: usize,
    /// Record kind or entity type name.
    pub kind: String,
    /// Field name / value pairs in write order.
    pub fields: Vec<FieldView>,
}

/// One field of a [`RecordView`].
#[derive(Debug, Serialize)]
pub struct FieldView {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: serde_json::Value,
}

impl RecordView {
    /// Resolves names through `schema`.
    pub fn new(record: &LoggedRecord, schema: &Schema) -> Self {
        let tx = &record.transaction;
        Self {
            offset: record.offset,
            len: record.len,
            kind: schema.name_of(tx.definition),
            fields: tx
                .fields
                .iter()
                .map(|(id, value)| FieldView {
                    name: schema.name_of(*id),
                    value: json_value(value),
                })
                .collect(),
        }
    }

    /// Formats the record on one line.
    pub fn to_line(&self) -> String {
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|field| format!("{}={}", field.name, field.value))
            .collect();
        format!(
            "{:>10}  {:>5}B  {:<16} {}",
            self.offset,
            self.len,
            self.kind,
            fields.join(" ")
        )
    }
}

/// Byte strings become lowercase hex.
pub fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => serde_json::Value::from(*n),
        Value::Bytes(bytes) => {
            serde_json::Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
        Value::Text(text) => serde_json::Value::String(text.clone()),
    }
}

/// Prints records as text lines or a JSON array.
pub fn print(records: &[RecordView], format: super::Format) -> Result<(), serde_json::Error> {
    match format {
        super::Format::Json => println!("{}", serde_json::to_string_pretty(records)?),
        super::Format::Text => {
            for record in records {
                println!("{}", record.to_line());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockwire_core::{Timestamp, Transaction};

    #[test]
    fn header_record_uses_reserved_names() {
        let record = LoggedRecord {
            offset: 0,
            len: 9,
            transaction: Transaction::header(1, Timestamp(5)),
        };
        let view = RecordView::new(&record, &Schema::new());
        assert_eq!(view.kind, "Transaction");
        assert_eq!(view.fields[1].name, "FormatVersion");
        assert_eq!(view.fields.len(), 2);
        assert_eq!(view.fields[0].value, serde_json::json!(5));
        assert!(view.to_line().contains(&view.kind));
    }

    #[test]
    fn values_map_to_json() {
        assert_eq!(json_value(&Value::Null), serde_json::Value::Null);
        assert_eq!(json_value(&Value::Bool(true)), serde_json::json!(true));
        assert_eq!(json_value(&Value::Integer(-3)), serde_json::json!(-3));
        assert_eq!(json_value(&Value::Bytes(vec![0, 255])), serde_json::json!("00ff"));
        assert_eq!(json_value(&Value::Text("hi".into())), serde_json::json!("hi"));
    }
}
