//! Write-side record building and partition batching.
//!
//! Caller-built records are grouped in encounter order by the partition key
//! derived from each record's primary timestamp. The build result keeps the
//! flat entry list alongside a readable cursor; [`PartitionedRecordSet::remainder`]
//! is a pure function of the cursor position, so a caller that consumed part
//! of the set can still serialize exactly the not-yet-visited records into
//! per-partition write batches.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    errors::ClientError,
    protocol::{Msg, OpCode, errors::ProtocolError, wire},
    record::{FieldValue, Record},
    recordset::{RecordSet, VecSource},
    schema::{FieldRef, SeriesDefinition, TimeRange, TimeUnit, TypeRef},
};

/// Builder accumulating records for a bulk write.
///
/// Starting a new record finalizes the previous one into its partition
/// bucket; fields left unset default to the zero value of their type.
#[derive(Debug)]
pub struct RecordSetBuilder {
    definition: Arc<SeriesDefinition>,
    pending: Option<PendingRecord>,
    entries: Vec<(TimeRange, Record)>,
}

#[derive(Debug)]
struct PendingRecord {
    type_index: usize,
    values: Vec<Option<FieldValue>>,
}

impl RecordSetBuilder {
    /// Create a builder for `definition`.
    #[must_use]
    pub const fn new(definition: Arc<SeriesDefinition>) -> Self {
        Self {
            definition,
            pending: None,
            entries: Vec::new(),
        }
    }

    /// Start a record of the given type, finalizing any record in progress.
    ///
    /// # Errors
    /// Returns a protocol violation for an unknown record type, and
    /// propagates finalization failures of the previous record.
    pub fn new_record<'a>(mut self, record_type: impl Into<TypeRef<'a>>) -> Result<Self, ClientError> {
        self.finalize_pending()?;
        let type_index = self.definition.resolve_type(record_type.into())?;
        let field_count = self.definition.record_type(type_index)?.field_count();
        self.pending = Some(PendingRecord {
            type_index,
            values: vec![None; field_count],
        });
        Ok(self)
    }

    /// Set a long field of the record in progress.
    ///
    /// # Errors
    /// Returns [`ClientError::IllegalState`] without a record in progress, a
    /// protocol violation for unknown fields, or a mismatch against the
    /// declared field type.
    pub fn set_long<'a>(self, field: impl Into<FieldRef<'a>>, value: i64) -> Result<Self, ClientError> {
        self.set_value(field.into(), FieldValue::Long(value))
    }

    /// Set an int field of the record in progress.
    ///
    /// # Errors
    /// See [`RecordSetBuilder::set_long`].
    pub fn set_int<'a>(self, field: impl Into<FieldRef<'a>>, value: i32) -> Result<Self, ClientError> {
        self.set_value(field.into(), FieldValue::Int(value))
    }

    /// Set a byte field of the record in progress.
    ///
    /// # Errors
    /// See [`RecordSetBuilder::set_long`].
    pub fn set_byte<'a>(self, field: impl Into<FieldRef<'a>>, value: u8) -> Result<Self, ClientError> {
        self.set_value(field.into(), FieldValue::Byte(value))
    }

    /// Set a double field of the record in progress.
    ///
    /// # Errors
    /// See [`RecordSetBuilder::set_long`].
    pub fn set_double<'a>(
        self,
        field: impl Into<FieldRef<'a>>,
        value: f64,
    ) -> Result<Self, ClientError> {
        self.set_value(field.into(), FieldValue::Double(value))
    }

    /// Set a decimal field of the record in progress.
    ///
    /// # Errors
    /// See [`RecordSetBuilder::set_long`].
    pub fn set_decimal<'a>(
        self,
        field: impl Into<FieldRef<'a>>,
        mantissa: i64,
        exponent: i32,
    ) -> Result<Self, ClientError> {
        self.set_value(field.into(), FieldValue::Decimal { mantissa, exponent })
    }

    /// Set a timestamp field of the record in progress. The value is given
    /// in `unit` and converted into the field's declared unit.
    ///
    /// # Errors
    /// See [`RecordSetBuilder::set_long`].
    pub fn set_timestamp<'a>(
        self,
        field: impl Into<FieldRef<'a>>,
        value: i64,
        unit: TimeUnit,
    ) -> Result<Self, ClientError> {
        let field_ref = field.into();
        let Some(pending) = &self.pending else {
            return Err(ClientError::IllegalState(
                "new_record must be called before setting fields",
            ));
        };
        let record_type = self.definition.record_type(pending.type_index)?;
        let index = record_type.resolve_field(field_ref)?;
        let declared = match record_type.field_type_at(index)? {
            crate::schema::FieldType::Timestamp(declared_unit) => declared_unit,
            _ => {
                return Err(ClientError::Protocol(ProtocolError::FieldTypeMismatch {
                    expected: "timestamp",
                }));
            }
        };
        self.store(index, FieldValue::Timestamp {
            value: unit.convert(value, declared),
            unit: declared,
        })
    }

    /// Finalize the record in progress and build the partitioned set.
    ///
    /// # Errors
    /// Propagates finalization failures of the last record.
    pub fn build(mut self) -> Result<PartitionedRecordSet, ClientError> {
        self.finalize_pending()?;
        Ok(PartitionedRecordSet::new(self.definition, self.entries))
    }

    fn set_value(self, field: FieldRef<'_>, value: FieldValue) -> Result<Self, ClientError> {
        let Some(pending) = &self.pending else {
            return Err(ClientError::IllegalState(
                "new_record must be called before setting fields",
            ));
        };
        let record_type = self.definition.record_type(pending.type_index)?;
        let index = record_type.resolve_field(field)?;
        if !value.matches(record_type.field_type_at(index)?) {
            return Err(ClientError::Protocol(ProtocolError::FieldTypeMismatch {
                expected: "declared field type",
            }));
        }
        self.store(index, value)
    }

    fn store(mut self, index: usize, value: FieldValue) -> Result<Self, ClientError> {
        let Some(pending) = &mut self.pending else {
            return Err(ClientError::IllegalState(
                "new_record must be called before setting fields",
            ));
        };
        let count = pending.values.len();
        let slot = pending
            .values
            .get_mut(index)
            .ok_or(ProtocolError::FieldIndexOutOfRange { index, count })?;
        *slot = Some(value);
        Ok(self)
    }

    fn finalize_pending(&mut self) -> Result<(), ClientError> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let record_type = self.definition.record_type(pending.type_index)?;
        let mut values = Vec::with_capacity(pending.values.len());
        for (index, value) in pending.values.into_iter().enumerate() {
            match value {
                Some(set) => values.push(set),
                None => values.push(FieldValue::zero_for(record_type.field_type_at(index)?)),
            }
        }
        let timestamp_ms = values
            .first()
            .ok_or(ClientError::Protocol(ProtocolError::IncompleteFullRecord))?
            .timestamp_in(TimeUnit::Milliseconds)?;
        let range = self.definition.partition_for(timestamp_ms)?;
        self.entries
            .push((range, Record::full(pending.type_index, values)));
        Ok(())
    }
}

/// The immutable build result: records grouped by partition, plus a forward
/// cursor usable to read the set back.
pub struct PartitionedRecordSet {
    entries: Vec<(TimeRange, Record)>,
    inner: RecordSet<VecSource>,
}

impl PartitionedRecordSet {
    fn new(definition: Arc<SeriesDefinition>, entries: Vec<(TimeRange, Record)>) -> Self {
        let records = entries.iter().map(|(_, record)| record.clone()).collect();
        Self {
            entries,
            inner: RecordSet::new(definition, VecSource::new(records)),
        }
    }

    /// Total number of records in the set.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the set holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// The definition the records were built against.
    #[must_use]
    pub fn definition(&self) -> &SeriesDefinition { self.inner.definition() }

    /// The readable cursor over this set. Advancing it moves the replay
    /// position used by [`PartitionedRecordSet::remainder`].
    pub fn cursor(&mut self) -> &mut RecordSet<VecSource> { &mut self.inner }

    /// The not-yet-visited records grouped by partition: first-seen key
    /// order, insertion order within each partition.
    #[must_use]
    pub fn remainder(&self) -> Vec<(TimeRange, Vec<Record>)> {
        let position = self.inner.source().position();
        group_by_partition(self.entries.get(position..).unwrap_or_default())
    }
}

fn group_by_partition(entries: &[(TimeRange, Record)]) -> Vec<(TimeRange, Vec<Record>)> {
    let mut grouped: Vec<(TimeRange, Vec<Record>)> = Vec::new();
    for (range, record) in entries {
        match grouped.iter_mut().find(|(key, _)| key == range) {
            Some((_, bucket)) => bucket.push(record.clone()),
            None => grouped.push((*range, vec![record.clone()])),
        }
    }
    grouped
}

/// One decoded bulk-write payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    /// Target database.
    pub database: String,
    /// Target series.
    pub series: String,
    /// Start of the partition the batch belongs to, epoch milliseconds.
    pub partition_start_ms: i64,
    /// The records of the batch in insertion order.
    pub records: Vec<Record>,
}

/// Encode one per-partition write batch into a bulk-write request.
///
/// # Errors
/// Returns a [`ProtocolError`] if a record does not match the definition.
pub fn encode_bulk_write(
    database: &str,
    series: &str,
    range: TimeRange,
    records: &[Record],
    definition: &SeriesDefinition,
) -> Result<Msg, ProtocolError> {
    let mut out = BytesMut::new();
    wire::write_str(&mut out, database);
    wire::write_str(&mut out, series);
    wire::write_varint_i64(&mut out, range.start_ms);
    wire::write_len(&mut out, records.len());
    for record in records {
        let record_type = definition.record_type(record.type_index())?;
        let mut body = BytesMut::new();
        record.encode_body(record_type, &mut body)?;
        let tag = u8::try_from(record.type_index()).map_err(|_| {
            ProtocolError::UnknownRecordType {
                index: record.type_index(),
                known: definition.type_count(),
            }
        })?;
        out.put_u8(tag);
        wire::write_len(&mut out, body.len());
        out.extend_from_slice(&body);
    }
    Ok(Msg::request(OpCode::BulkWrite, out.freeze()))
}

/// Decode a bulk-write payload back into a [`WriteBatch`].
///
/// # Errors
/// Returns a [`ProtocolError`] for malformed payloads or records that do not
/// match the definition.
pub fn decode_bulk_write(
    payload: &Bytes,
    definition: &SeriesDefinition,
) -> Result<WriteBatch, ProtocolError> {
    let mut view = payload.clone();
    let database = wire::read_str(&mut view)?;
    let series = wire::read_str(&mut view)?;
    let partition_start_ms = wire::read_varint_i64(&mut view)?;
    let count = wire::read_len(&mut view)?;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = wire::read_u8(&mut view)?;
        let type_index = usize::from(tag);
        let record_type = definition.record_type(type_index)?;
        let body_len = wire::read_len(&mut view)?;
        if view.remaining() < body_len {
            return Err(ProtocolError::ShortBuffer);
        }
        let mut body = view.split_to(body_len);
        let record = Record::decode_body(type_index, record_type, &mut body)?;
        if body.has_remaining() {
            return Err(ProtocolError::SizeMismatch);
        }
        records.push(record);
    }
    Ok(WriteBatch {
        database,
        series,
        partition_start_ms,
        records,
    })
}
