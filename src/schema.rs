//! Series and record-type definitions.
//!
//! A series is described by an ordered list of record types, each an ordered
//! list of typed fields. The first field of every record type is its primary
//! timestamp; the series' partitioning strategy maps that timestamp onto a
//! half-open [`TimeRange`] used to group write batches. Definitions travel
//! on the wire inside data-header and create-series payloads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    MAX_FIELDS,
    MAX_RECORD_TYPES,
    errors::ProtocolError,
    wire::{read_len, read_str, read_u8, read_varint_i64, write_len, write_str, write_varint_i64},
};

/// Milliseconds in one calendar day.
const DAY_MS: i64 = 86_400_000;

/// Errors raised while building definitions or deriving partitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// A record type declares no fields.
    #[error("record type has no fields")]
    NoFields,
    /// The first field of a record type is not a timestamp.
    #[error("first field must be a timestamp")]
    MissingTimestamp,
    /// Two fields of one record type share a name.
    #[error("duplicate field {0:?}")]
    DuplicateField(String),
    /// Two record types of one series share a name.
    #[error("duplicate record type {0:?}")]
    DuplicateRecordType(String),
    /// A record type declares more fields than the presence bitmap can hold.
    #[error("{0} fields exceeds the limit of 64")]
    TooManyFields(usize),
    /// A series declares more record types than a tag byte can address.
    #[error("{0} record types exceeds the limit of 64")]
    TooManyRecordTypes(usize),
    /// The fixed partition window is not a positive duration.
    #[error("partition window of {0} ms must be positive")]
    InvalidWindow(i64),
    /// A timestamp falls outside the partitionable range.
    #[error("timestamp {0} outside the partitionable range")]
    TimestampOutOfRange(i64),
}

/// Resolution of a timestamp value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    /// Whole seconds.
    Seconds,
    /// Milliseconds.
    Milliseconds,
    /// Microseconds.
    Microseconds,
    /// Nanoseconds.
    Nanoseconds,
}

impl TimeUnit {
    const fn nanos_per_unit(self) -> i64 {
        match self {
            Self::Seconds => 1_000_000_000,
            Self::Milliseconds => 1_000_000,
            Self::Microseconds => 1_000,
            Self::Nanoseconds => 1,
        }
    }

    /// Convert `value` from this unit into `target`, truncating toward zero
    /// when narrowing.
    #[expect(
        clippy::integer_division,
        reason = "unit conversion truncates toward zero"
    )]
    #[must_use]
    pub const fn convert(self, value: i64, target: Self) -> i64 {
        let from = self.nanos_per_unit();
        let to = target.nanos_per_unit();
        if from >= to {
            value * (from / to)
        } else {
            value / (to / from)
        }
    }
}

/// Shape of a single record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// A timestamp stored in the declared unit.
    Timestamp(TimeUnit),
    /// A 64-bit signed integer.
    Long,
    /// A 32-bit signed integer.
    Int,
    /// A single byte.
    Byte,
    /// A 64-bit IEEE-754 double.
    Double,
    /// A decimal split into mantissa and exponent.
    Decimal,
}

impl FieldType {
    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::Timestamp(TimeUnit::Seconds) => 0,
            Self::Timestamp(TimeUnit::Milliseconds) => 1,
            Self::Timestamp(TimeUnit::Microseconds) => 2,
            Self::Timestamp(TimeUnit::Nanoseconds) => 3,
            Self::Long => 4,
            Self::Int => 5,
            Self::Byte => 6,
            Self::Double => 7,
            Self::Decimal => 8,
        }
    }

    pub(crate) const fn from_code(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(Self::Timestamp(TimeUnit::Seconds)),
            1 => Ok(Self::Timestamp(TimeUnit::Milliseconds)),
            2 => Ok(Self::Timestamp(TimeUnit::Microseconds)),
            3 => Ok(Self::Timestamp(TimeUnit::Nanoseconds)),
            4 => Ok(Self::Long),
            5 => Ok(Self::Int),
            6 => Ok(Self::Byte),
            7 => Ok(Self::Double),
            8 => Ok(Self::Decimal),
            other => Err(ProtocolError::InvalidFieldType(other)),
        }
    }
}

/// One named, typed field of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Field name, unique within its record type.
    pub name: String,
    /// Field shape.
    pub field_type: FieldType,
}

/// Reference to a field by index or by name.
#[derive(Debug, Clone, Copy)]
pub enum FieldRef<'a> {
    /// Positional reference.
    Index(usize),
    /// Reference by field name, resolved against the active record type.
    Name(&'a str),
}

impl From<usize> for FieldRef<'_> {
    fn from(index: usize) -> Self { Self::Index(index) }
}

impl<'a> From<&'a str> for FieldRef<'a> {
    fn from(name: &'a str) -> Self { Self::Name(name) }
}

/// Reference to a record type by index or by name.
#[derive(Debug, Clone, Copy)]
pub enum TypeRef<'a> {
    /// Positional reference.
    Index(usize),
    /// Reference by record type name.
    Name(&'a str),
}

impl From<usize> for TypeRef<'_> {
    fn from(index: usize) -> Self { Self::Index(index) }
}

impl<'a> From<&'a str> for TypeRef<'a> {
    fn from(name: &'a str) -> Self { Self::Name(name) }
}

/// Definition of one record type: an ordered list of typed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTypeDefinition {
    name: String,
    fields: Vec<FieldDefinition>,
}

impl RecordTypeDefinition {
    /// Start building a record type definition.
    #[must_use]
    pub fn builder(name: &str) -> RecordTypeBuilder {
        RecordTypeBuilder {
            name: name.to_owned(),
            fields: Vec::new(),
        }
    }

    /// Record type name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Number of fields.
    #[must_use]
    pub fn field_count(&self) -> usize { self.fields.len() }

    /// The fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldDefinition] { &self.fields }

    /// Resolve a field reference to its index.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownField`] or
    /// [`ProtocolError::FieldIndexOutOfRange`] for unresolvable references.
    pub fn resolve_field(&self, field: FieldRef<'_>) -> Result<usize, ProtocolError> {
        match field {
            FieldRef::Index(index) if index < self.fields.len() => Ok(index),
            FieldRef::Index(index) => Err(ProtocolError::FieldIndexOutOfRange {
                index,
                count: self.fields.len(),
            }),
            FieldRef::Name(name) => self
                .fields
                .iter()
                .position(|f| f.name == name)
                .ok_or_else(|| ProtocolError::UnknownField(name.to_owned())),
        }
    }

    /// Shape of the field at `index`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldIndexOutOfRange`] if `index` is out of
    /// range.
    pub fn field_type_at(&self, index: usize) -> Result<FieldType, ProtocolError> {
        self.fields
            .get(index)
            .map(|f| f.field_type)
            .ok_or_else(|| ProtocolError::FieldIndexOutOfRange {
                index,
                count: self.fields.len(),
            })
    }

}

/// Builder for [`RecordTypeDefinition`].
#[derive(Debug)]
pub struct RecordTypeBuilder {
    name: String,
    fields: Vec<FieldDefinition>,
}

impl RecordTypeBuilder {
    /// Append a field.
    #[must_use]
    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_owned(),
            field_type,
        });
        self
    }

    /// Validate and build the definition.
    ///
    /// The first field must be a timestamp (the record's primary timestamp),
    /// field names must be unique, and the field count must fit the presence
    /// bitmap.
    ///
    /// # Errors
    /// Returns a [`SchemaError`] describing the violated constraint.
    pub fn build(self) -> Result<RecordTypeDefinition, SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::NoFields);
        }
        if self.fields.len() > MAX_FIELDS {
            return Err(SchemaError::TooManyFields(self.fields.len()));
        }
        if !matches!(
            self.fields.first().map(|f| f.field_type),
            Some(FieldType::Timestamp(_))
        ) {
            return Err(SchemaError::MissingTimestamp);
        }
        for (position, field) in self.fields.iter().enumerate() {
            if self.fields.iter().take(position).any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }
        Ok(RecordTypeDefinition {
            name: self.name,
            fields: self.fields,
        })
    }
}

/// Partitioning strategy mapping a timestamp to its time-range bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partitioning {
    /// One partition per UTC calendar day.
    ByDay,
    /// Fixed-width windows aligned to the epoch.
    ByWindow {
        /// Window width in milliseconds; must be positive.
        millis: i64,
    },
}

impl Partitioning {
    /// Bucket a millisecond timestamp into its partition range.
    ///
    /// # Errors
    /// Returns [`SchemaError::TimestampOutOfRange`] for timestamps chrono
    /// cannot represent, or [`SchemaError::InvalidWindow`] for a
    /// non-positive window.
    pub fn partition_for(self, timestamp_ms: i64) -> Result<TimeRange, SchemaError> {
        match self {
            Self::ByDay => {
                let instant = Utc
                    .timestamp_millis_opt(timestamp_ms)
                    .single()
                    .ok_or(SchemaError::TimestampOutOfRange(timestamp_ms))?;
                let start_ms = instant
                    .date_naive()
                    .and_time(NaiveTime::MIN)
                    .and_utc()
                    .timestamp_millis();
                Ok(TimeRange {
                    start_ms,
                    end_ms: start_ms + DAY_MS,
                })
            }
            Self::ByWindow { millis } => {
                if millis <= 0 {
                    return Err(SchemaError::InvalidWindow(millis));
                }
                #[expect(
                    clippy::integer_division_remainder_used,
                    reason = "window alignment needs the euclidean remainder"
                )]
                let offset = timestamp_ms.rem_euclid(millis);
                let start_ms = timestamp_ms - offset;
                Ok(TimeRange {
                    start_ms,
                    end_ms: start_ms + millis,
                })
            }
        }
    }
}

/// Half-open `[start_ms, end_ms)` time range keying one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start, epoch milliseconds.
    pub start_ms: i64,
    /// Exclusive end, epoch milliseconds.
    pub end_ms: i64,
}

/// Definition of a series: its record types and partitioning strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesDefinition {
    name: String,
    partitioning: Partitioning,
    record_types: Vec<RecordTypeDefinition>,
}

impl SeriesDefinition {
    /// Start building a series definition.
    #[must_use]
    pub fn builder(name: &str) -> SeriesBuilder {
        SeriesBuilder {
            name: name.to_owned(),
            partitioning: Partitioning::ByDay,
            record_types: Vec::new(),
        }
    }

    /// A definition with no record types, used for result sets of
    /// operations that return no records.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            partitioning: Partitioning::ByDay,
            record_types: Vec::new(),
        }
    }

    /// Series name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Partitioning strategy.
    #[must_use]
    pub const fn partitioning(&self) -> Partitioning { self.partitioning }

    /// The record types in declaration order.
    #[must_use]
    pub fn record_types(&self) -> &[RecordTypeDefinition] { &self.record_types }

    /// Number of record types.
    #[must_use]
    pub fn type_count(&self) -> usize { self.record_types.len() }

    /// The record type at `index`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownRecordType`] if `index` exceeds the
    /// known type count; this indicates a schema mismatch between client and
    /// stream.
    pub fn record_type(&self, index: usize) -> Result<&RecordTypeDefinition, ProtocolError> {
        self.record_types
            .get(index)
            .ok_or_else(|| ProtocolError::UnknownRecordType {
                index,
                known: self.record_types.len(),
            })
    }

    /// Resolve a record type reference to its index.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownRecordTypeName`] or
    /// [`ProtocolError::UnknownRecordType`] for unresolvable references.
    pub fn resolve_type(&self, type_ref: TypeRef<'_>) -> Result<usize, ProtocolError> {
        match type_ref {
            TypeRef::Index(index) if index < self.record_types.len() => Ok(index),
            TypeRef::Index(index) => Err(ProtocolError::UnknownRecordType {
                index,
                known: self.record_types.len(),
            }),
            TypeRef::Name(name) => self
                .record_types
                .iter()
                .position(|t| t.name == name)
                .ok_or_else(|| ProtocolError::UnknownRecordTypeName(name.to_owned())),
        }
    }

    /// Resolve a field of the record type at `type_index`.
    ///
    /// # Errors
    /// Propagates the failures of [`SeriesDefinition::record_type`] and
    /// [`RecordTypeDefinition::resolve_field`].
    pub fn field_index(
        &self,
        type_index: usize,
        field: FieldRef<'_>,
    ) -> Result<usize, ProtocolError> {
        self.record_type(type_index)?.resolve_field(field)
    }

    /// Bucket a millisecond timestamp with this series' partitioning.
    ///
    /// # Errors
    /// Propagates the failures of [`Partitioning::partition_for`].
    pub fn partition_for(&self, timestamp_ms: i64) -> Result<TimeRange, SchemaError> {
        self.partitioning.partition_for(timestamp_ms)
    }

    /// Encode the definition into `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        write_str(out, &self.name);
        match self.partitioning {
            Partitioning::ByDay => out.put_u8(0),
            Partitioning::ByWindow { millis } => {
                out.put_u8(1);
                write_varint_i64(out, millis);
            }
        }
        write_len(out, self.record_types.len());
        for record_type in &self.record_types {
            write_str(out, &record_type.name);
            write_len(out, record_type.fields.len());
            for field in &record_type.fields {
                write_str(out, &field.name);
                out.put_u8(field.field_type.code());
            }
        }
    }

    /// Encode the definition into a fresh payload.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }

    /// Decode a definition from wire bytes.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] for malformed bytes or a definition
    /// violating the type/field caps.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let name = read_str(buf)?;
        let partitioning = match read_u8(buf)? {
            0 => Partitioning::ByDay,
            1 => Partitioning::ByWindow {
                millis: read_varint_i64(buf)?,
            },
            other => return Err(ProtocolError::InvalidPartitioning(other)),
        };
        let type_count = read_len(buf)?;
        if type_count > MAX_RECORD_TYPES {
            return Err(ProtocolError::LengthOutOfRange(type_count as u64));
        }
        let mut record_types = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            let type_name = read_str(buf)?;
            let field_count = read_len(buf)?;
            if field_count > MAX_FIELDS {
                return Err(ProtocolError::LengthOutOfRange(field_count as u64));
            }
            let mut fields = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                let field_name = read_str(buf)?;
                let field_type = FieldType::from_code(read_u8(buf)?)?;
                fields.push(FieldDefinition {
                    name: field_name,
                    field_type,
                });
            }
            record_types.push(RecordTypeDefinition {
                name: type_name,
                fields,
            });
        }
        Ok(Self {
            name,
            partitioning,
            record_types,
        })
    }
}

/// Builder for [`SeriesDefinition`].
#[derive(Debug)]
pub struct SeriesBuilder {
    name: String,
    partitioning: Partitioning,
    record_types: Vec<RecordTypeDefinition>,
}

impl SeriesBuilder {
    /// Set the partitioning strategy (defaults to [`Partitioning::ByDay`]).
    #[must_use]
    pub const fn partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    /// Append a record type.
    #[must_use]
    pub fn record_type(mut self, definition: RecordTypeDefinition) -> Self {
        self.record_types.push(definition);
        self
    }

    /// Validate and build the definition.
    ///
    /// # Errors
    /// Returns a [`SchemaError`] if the type count exceeds the tag range,
    /// type names collide, or the partition window is invalid.
    pub fn build(self) -> Result<SeriesDefinition, SchemaError> {
        if self.record_types.len() > MAX_RECORD_TYPES {
            return Err(SchemaError::TooManyRecordTypes(self.record_types.len()));
        }
        if let Partitioning::ByWindow { millis } = self.partitioning {
            if millis <= 0 {
                return Err(SchemaError::InvalidWindow(millis));
            }
        }
        for (position, record_type) in self.record_types.iter().enumerate() {
            if self
                .record_types
                .iter()
                .take(position)
                .any(|t| t.name == record_type.name)
            {
                return Err(SchemaError::DuplicateRecordType(record_type.name.clone()));
            }
        }
        Ok(SeriesDefinition {
            name: self.name,
            partitioning: self.partitioning,
            record_types: self.record_types,
        })
    }
}
