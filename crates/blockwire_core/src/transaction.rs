//! Transaction framing.
//!
//! Every record in the log is one transaction:
//!
//! ```text
//! | definition id | field count | (field id, value)* | field count | definition id |
//! ```
//!
//! Ids and counts are invertible compressed integers and values carry a tag
//! at both ends, so the trailing definition id and count let a reader step
//! backward from the end of one record to the end of the previous one.

use crate::error::{CoreError, CoreResult};
use crate::types::{reserved, DefinitionId, EntityId, Timestamp};
use blockwire_codec::{BufferPool, Chain, Segment, Value, Writer};

/// One self-describing log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Record kind or entity type; selects the replay path.
    pub definition: DefinitionId,
    /// Field id / value pairs in write order.
    pub fields: Vec<(DefinitionId, Value)>,
}

impl Transaction {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new(definition: DefinitionId) -> Self {
        Self {
            definition,
            fields: Vec::new(),
        }
    }

    /// Appends a field, builder style.
    #[must_use]
    pub fn with(mut self, field: DefinitionId, value: impl Into<Value>) -> Self {
        self.push(field, value);
        self
    }

    /// Appends a field.
    pub fn push(&mut self, field: DefinitionId, value: impl Into<Value>) {
        self.fields.push((field, value.into()));
    }

    /// Returns the first value stored under `field`.
    #[must_use]
    pub fn field(&self, field: DefinitionId) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(id, _)| *id == field)
            .map(|(_, value)| value)
    }

    /// Returns the record timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.field(reserved::TIMESTAMP)
            .and_then(Value::as_i64)
            .map(Timestamp)
    }

    /// Splits the fields at the first timestamp.
    ///
    /// Update and archive records put their target (entity, type, variant)
    /// before the timestamp; everything after it is the change set.
    #[must_use]
    pub fn split_header(&self) -> (&[(DefinitionId, Value)], &[(DefinitionId, Value)]) {
        match self.fields.iter().position(|(id, _)| *id == reserved::TIMESTAMP) {
            Some(at) => (&self.fields[..at], &self.fields[at + 1..]),
            None => (&self.fields[..], &self.fields[self.fields.len()..]),
        }
    }

    /// Returns true for records handled by the schema parser.
    #[must_use]
    pub fn is_schema(&self) -> bool {
        matches!(
            self.definition,
            reserved::TRANSACTION
                | reserved::FIELD
                | reserved::ENTITY_TYPE
                | reserved::PROJECT_META
                | reserved::BLOCK_BOUNDARY
        )
    }

    /// Returns the number of bytes the encoded record occupies.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        use blockwire_codec::varint::encoded_len;
        let count = self.fields.len() as u64;
        let frame = 2 * (encoded_len(self.definition.0) + encoded_len(count));
        let body: usize = self
            .fields
            .iter()
            .map(|(id, value)| encoded_len(id.0) + value.encoded_len())
            .sum();
        frame + body
    }

    /// Appends the encoded record to `writer`.
    pub fn encode(&self, writer: &mut Writer) {
        let count = self.fields.len() as u64;
        writer.write_compressed(self.definition.0);
        writer.write_compressed(count);
        for (id, value) in &self.fields {
            writer.write_compressed(id.0);
            writer.write_value(value);
        }
        writer.write_compressed(count);
        writer.write_compressed(self.definition.0);
    }

    /// Encodes the record into a fresh chain from `pool`.
    #[must_use]
    pub fn to_chain(&self, pool: &BufferPool) -> Chain {
        let mut writer = Writer::with_pool(pool.clone());
        self.encode(&mut writer);
        writer.into_chain()
    }

    /// Decodes one record from the front of `segment`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] for incomplete or malformed encodings
    /// and [`CoreError::SentinelMismatch`] if the trailing count or
    /// definition id differs from the leading one.
    pub fn decode(segment: &mut Segment<'_>) -> CoreResult<Self> {
        let definition = segment.read_compressed()?;
        let count = segment.read_compressed()?;
        let mut fields = Vec::with_capacity(capacity_hint(count, segment.remaining()));
        for _ in 0..count {
            let id = segment.read_compressed()?;
            let value = segment.read_value()?;
            fields.push((DefinitionId(id), value));
        }
        check_sentinel("field count", count, segment.read_compressed()?)?;
        check_sentinel("definition id", definition, segment.read_compressed()?)?;
        Ok(Self {
            definition: DefinitionId(definition),
            fields,
        })
    }

    /// Decodes one record from the back of `segment`.
    ///
    /// # Errors
    ///
    /// Same as [`decode`](Self::decode).
    pub fn decode_backward(segment: &mut Segment<'_>) -> CoreResult<Self> {
        let definition = segment.read_compressed_back()?;
        let count = segment.read_compressed_back()?;
        let mut fields = Vec::with_capacity(capacity_hint(count, segment.remaining()));
        for _ in 0..count {
            let value = segment.read_value_back()?;
            let id = segment.read_compressed_back()?;
            fields.push((DefinitionId(id), value));
        }
        fields.reverse();
        check_sentinel("field count", segment.read_compressed_back()?, count)?;
        check_sentinel("definition id", segment.read_compressed_back()?, definition)?;
        Ok(Self {
            definition: DefinitionId(definition),
            fields,
        })
    }

    /// Builds the log header record.
    #[must_use]
    pub fn header(format_version: u64, ts: Timestamp) -> Self {
        Self::new(reserved::TRANSACTION)
            .with(reserved::TIMESTAMP, ts.0)
            .with(reserved::FORMAT_VERSION, int(format_version))
    }

    /// Builds a block boundary record.
    #[must_use]
    pub fn block_boundary(block_number: u64, ts: Timestamp) -> Self {
        Self::new(reserved::BLOCK_BOUNDARY)
            .with(reserved::TIMESTAMP, ts.0)
            .with(reserved::BLOCK_NUMBER, int(block_number))
    }

    /// Builds a project entry record.
    #[must_use]
    pub fn project_meta(name: &str, value: Value, ts: Timestamp) -> Self {
        Self::new(reserved::PROJECT_META)
            .with(reserved::TIMESTAMP, ts.0)
            .with(reserved::NAME, name)
            .with(reserved::META_VALUE, value)
    }

    /// Builds a field update of an existing entity.
    #[must_use]
    pub fn set_fields(
        definition: DefinitionId,
        entity: EntityId,
        variant: Option<DefinitionId>,
        ts: Timestamp,
        changes: Vec<(DefinitionId, Value)>,
    ) -> Self {
        let mut tx = Self::new(reserved::SET_FIELDS)
            .with(reserved::ENTITY_ID, int(entity.0))
            .with(reserved::DEFINITION_ID, int(definition.0));
        if let Some(variant) = variant {
            tx.push(reserved::VARIANT_TYPE_ID, int(variant.0));
        }
        tx.push(reserved::TIMESTAMP, ts.0);
        tx.fields.extend(changes);
        tx
    }

    /// Builds the removal of an existing entity.
    #[must_use]
    pub fn archive(definition: DefinitionId, entity: EntityId, ts: Timestamp) -> Self {
        Self::new(reserved::ARCHIVE)
            .with(reserved::ENTITY_ID, int(entity.0))
            .with(reserved::DEFINITION_ID, int(definition.0))
            .with(reserved::TIMESTAMP, ts.0)
    }

    /// Returns the (type, entity) target of an update or archive record.
    #[must_use]
    pub fn target(&self) -> Option<(DefinitionId, EntityId)> {
        let (header, _) = self.split_header();
        let lookup = |want: DefinitionId| {
            header
                .iter()
                .find(|(id, _)| *id == want)
                .and_then(|(_, v)| v.as_u64())
        };
        Some((
            DefinitionId(lookup(reserved::DEFINITION_ID)?),
            EntityId(lookup(reserved::ENTITY_ID)?),
        ))
    }
}

/// Ids and counters are stored as integer values.
#[allow(clippy::cast_possible_wrap)]
fn int(value: u64) -> i64 {
    value as i64
}

fn capacity_hint(count: u64, remaining: usize) -> usize {
    // every pair takes at least two bytes
    usize::try_from(count).map_or(0, |c| c.min(remaining / 2))
}

fn check_sentinel(what: &'static str, leading: u64, trailing: u64) -> CoreResult<()> {
    if leading == trailing {
        Ok(())
    } else {
        Err(CoreError::SentinelMismatch {
            what,
            leading,
            trailing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockwire_codec::CodecError;
    use proptest::prelude::*;

    fn pool() -> BufferPool {
        BufferPool::new(16)
    }

    fn sample() -> Transaction {
        Transaction::new(DefinitionId(70))
            .with(reserved::TIMESTAMP, 1_700_000_000_000_000i64)
            .with(DefinitionId(71), "title")
            .with(DefinitionId(72), Value::Null)
            .with(DefinitionId(73), vec![0u8; 40])
    }

    #[test]
    fn sentinels_are_equal() {
        let tx = sample();
        let chain = tx.to_chain(&pool());
        let mut seg = chain.segment();
        let leading = seg.read_compressed().unwrap();
        let trailing = seg.read_compressed_back().unwrap();
        assert_eq!(leading, trailing);
        assert_eq!(leading, 70);
    }

    #[test]
    fn forward_and_backward_decode_agree() {
        let tx = sample();
        let chain = tx.to_chain(&pool());
        assert_eq!(chain.len(), tx.encoded_len());

        let mut seg = chain.segment();
        assert_eq!(Transaction::decode(&mut seg).unwrap(), tx);
        assert!(seg.is_empty());

        let mut seg = chain.segment();
        assert_eq!(Transaction::decode_backward(&mut seg).unwrap(), tx);
        assert!(seg.is_empty());
    }

    #[test]
    fn truncated_record_is_incomplete() {
        let bytes = sample().to_chain(&pool()).to_vec();
        let cut = Chain::from_slice(pool(), &bytes[..bytes.len() - 1]);
        let err = Transaction::decode(&mut cut.segment()).unwrap_err();
        assert!(err.is_incomplete());
    }

    #[test]
    fn mismatched_trailer_detected() {
        let mut bytes = Transaction::header(1, Timestamp(5)).to_chain(&pool()).to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 2;
        let chain = Chain::from_slice(pool(), &bytes);
        assert!(matches!(
            Transaction::decode(&mut chain.segment()),
            Err(CoreError::SentinelMismatch {
                what: "definition id",
                leading: 1,
                trailing: 2
            })
        ));
    }

    #[test]
    fn reserved_marker_is_structural() {
        let chain = Chain::from_slice(pool(), &[255, 0, 0]);
        let err = Transaction::decode(&mut chain.segment()).unwrap_err();
        assert!(matches!(err, CoreError::Codec(CodecError::ReservedMarker)));
        assert!(!err.is_incomplete());
    }

    #[test]
    fn header_zone_split() {
        let tx = Transaction::set_fields(
            DefinitionId(70),
            EntityId(3),
            Some(DefinitionId(80)),
            Timestamp(9),
            vec![(DefinitionId(71), Value::from("new"))],
        );
        let (header, changes) = tx.split_header();
        assert_eq!(header.len(), 3);
        assert_eq!(changes, &[(DefinitionId(71), Value::from("new"))]);
        assert_eq!(tx.target(), Some((DefinitionId(70), EntityId(3))));
        assert_eq!(tx.timestamp(), Some(Timestamp(9)));
    }

    #[test]
    fn archive_has_no_changes() {
        let tx = Transaction::archive(DefinitionId(70), EntityId(1), Timestamp(2));
        let (_, changes) = tx.split_header();
        assert!(changes.is_empty());
        assert!(!tx.is_schema());
        assert!(Transaction::block_boundary(1, Timestamp(0)).is_schema());
    }

    fn field_strategy() -> impl Strategy<Value = (DefinitionId, Value)> {
        let value = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
            "[a-z]{0,20}".prop_map(Value::Text),
        ];
        (any::<u64>().prop_map(DefinitionId), value)
    }

    proptest! {
        #[test]
        fn backward_reads_records_in_reverse(
            records in proptest::collection::vec(
                (64u64..100_000, proptest::collection::vec(field_strategy(), 0..8)),
                1..10,
            ),
        ) {
            let pool = BufferPool::new(32);
            let mut writer = Writer::with_pool(pool);
            let txs: Vec<Transaction> = records
                .into_iter()
                .map(|(def, fields)| Transaction { definition: DefinitionId(def), fields })
                .collect();
            for tx in &txs {
                tx.encode(&mut writer);
            }

            let mut seg = writer.segment();
            let mut back = Vec::new();
            while !seg.is_empty() {
                back.push(Transaction::decode_backward(&mut seg).unwrap());
            }
            back.reverse();
            prop_assert_eq!(back, txs);
        }
    }
}
