//! Records and the delta-merge operation.
//!
//! A decoded record is either a full snapshot (every field present) or a
//! delta (a subset of fields, the rest taken from the previously
//! materialized record of the same type). Bodies are encoded as a flags
//! byte, a presence bitmap, and the present field values in declaration
//! order. Merging a record onto a retained slot is an explicit operation so
//! the delta semantics are testable without a stream.

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    protocol::{
        errors::ProtocolError,
        wire::{read_f64, read_u8, read_varint_i32, read_varint_i64, read_varint_u64, write_f64,
               write_varint_i32, write_varint_i64, write_varint_u64},
    },
    schema::{FieldType, RecordTypeDefinition, TimeUnit},
};

/// Body flag bit marking a delta record.
const FLAG_DELTA: u8 = 0b0000_0001;

/// One field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// A timestamp in the field's declared unit.
    Timestamp {
        /// Timestamp value in `unit`.
        value: i64,
        /// Unit the value is stored in.
        unit: TimeUnit,
    },
    /// A 64-bit signed integer.
    Long(i64),
    /// A 32-bit signed integer.
    Int(i32),
    /// A single byte.
    Byte(u8),
    /// A 64-bit IEEE-754 double.
    Double(f64),
    /// A decimal split into mantissa and exponent.
    Decimal {
        /// Significand.
        mantissa: i64,
        /// Power-of-ten exponent.
        exponent: i32,
    },
}

impl FieldValue {
    /// The zero value of a field type.
    #[must_use]
    pub const fn zero_for(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Timestamp(unit) => Self::Timestamp { value: 0, unit },
            FieldType::Long => Self::Long(0),
            FieldType::Int => Self::Int(0),
            FieldType::Byte => Self::Byte(0),
            FieldType::Double => Self::Double(0.0),
            FieldType::Decimal => Self::Decimal {
                mantissa: 0,
                exponent: 0,
            },
        }
    }

    /// Whether this value matches the declared field type.
    #[must_use]
    pub const fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (Self::Timestamp { .. }, FieldType::Timestamp(_))
                | (Self::Long(_), FieldType::Long)
                | (Self::Int(_), FieldType::Int)
                | (Self::Byte(_), FieldType::Byte)
                | (Self::Double(_), FieldType::Double)
                | (Self::Decimal { .. }, FieldType::Decimal)
        )
    }

    /// Read the value as a long, widening smaller integers.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldTypeMismatch`] for non-integer values.
    pub fn as_long(&self) -> Result<i64, ProtocolError> {
        match *self {
            Self::Long(value) => Ok(value),
            Self::Int(value) => Ok(i64::from(value)),
            Self::Byte(value) => Ok(i64::from(value)),
            _ => Err(ProtocolError::FieldTypeMismatch { expected: "long" }),
        }
    }

    /// Read the value as an int, widening bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldTypeMismatch`] for other value shapes.
    pub fn as_int(&self) -> Result<i32, ProtocolError> {
        match *self {
            Self::Int(value) => Ok(value),
            Self::Byte(value) => Ok(i32::from(value)),
            _ => Err(ProtocolError::FieldTypeMismatch { expected: "int" }),
        }
    }

    /// Read the value as a byte.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldTypeMismatch`] for other value shapes.
    pub fn as_byte(&self) -> Result<u8, ProtocolError> {
        match *self {
            Self::Byte(value) => Ok(value),
            _ => Err(ProtocolError::FieldTypeMismatch { expected: "byte" }),
        }
    }

    /// Read the value as a double.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldTypeMismatch`] for other value shapes.
    pub fn as_double(&self) -> Result<f64, ProtocolError> {
        match *self {
            Self::Double(value) => Ok(value),
            _ => Err(ProtocolError::FieldTypeMismatch { expected: "double" }),
        }
    }

    /// Read the decimal mantissa.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldTypeMismatch`] for other value shapes.
    pub fn decimal_mantissa(&self) -> Result<i64, ProtocolError> {
        match *self {
            Self::Decimal { mantissa, .. } => Ok(mantissa),
            _ => Err(ProtocolError::FieldTypeMismatch { expected: "decimal" }),
        }
    }

    /// Read the decimal exponent.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldTypeMismatch`] for other value shapes.
    pub fn decimal_exponent(&self) -> Result<i32, ProtocolError> {
        match *self {
            Self::Decimal { exponent, .. } => Ok(exponent),
            _ => Err(ProtocolError::FieldTypeMismatch { expected: "decimal" }),
        }
    }

    /// Read a timestamp converted into `target`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldTypeMismatch`] for other value shapes.
    pub fn timestamp_in(&self, target: TimeUnit) -> Result<i64, ProtocolError> {
        match *self {
            Self::Timestamp { value, unit } => Ok(unit.convert(value, target)),
            _ => Err(ProtocolError::FieldTypeMismatch {
                expected: "timestamp",
            }),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        match *self {
            Self::Timestamp { value, .. } | Self::Long(value) => write_varint_i64(out, value),
            Self::Int(value) => write_varint_i32(out, value),
            Self::Byte(value) => out.put_u8(value),
            Self::Double(value) => write_f64(out, value),
            Self::Decimal { mantissa, exponent } => {
                write_varint_i64(out, mantissa);
                write_varint_i32(out, exponent);
            }
        }
    }

    fn decode(field_type: FieldType, buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        match field_type {
            FieldType::Timestamp(unit) => Ok(Self::Timestamp {
                value: read_varint_i64(buf)?,
                unit,
            }),
            FieldType::Long => read_varint_i64(buf).map(Self::Long),
            FieldType::Int => read_varint_i32(buf).map(Self::Int),
            FieldType::Byte => read_u8(buf).map(Self::Byte),
            FieldType::Double => read_f64(buf).map(Self::Double),
            FieldType::Decimal => Ok(Self::Decimal {
                mantissa: read_varint_i64(buf)?,
                exponent: read_varint_i32(buf)?,
            }),
        }
    }
}

/// One decoded record: a full snapshot or a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    type_index: usize,
    delta: bool,
    values: Vec<Option<FieldValue>>,
}

impl Record {
    /// Build a full record from one value per field.
    #[must_use]
    pub fn full(type_index: usize, values: Vec<FieldValue>) -> Self {
        Self {
            type_index,
            delta: false,
            values: values.into_iter().map(Some).collect(),
        }
    }

    /// Build an empty delta record for a type with `field_count` fields.
    #[must_use]
    pub fn delta(type_index: usize, field_count: usize) -> Self {
        Self {
            type_index,
            delta: true,
            values: vec![None; field_count],
        }
    }

    /// Set one field of this record.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldIndexOutOfRange`] if `index` is out of
    /// range.
    pub fn with_field(mut self, index: usize, value: FieldValue) -> Result<Self, ProtocolError> {
        let count = self.values.len();
        let slot = self
            .values
            .get_mut(index)
            .ok_or(ProtocolError::FieldIndexOutOfRange { index, count })?;
        *slot = Some(value);
        Ok(self)
    }

    /// Index of this record's type in the series definition.
    #[must_use]
    pub const fn type_index(&self) -> usize { self.type_index }

    /// Whether this record is a delta.
    #[must_use]
    pub const fn is_delta(&self) -> bool { self.delta }

    /// The field values; `None` marks fields a delta leaves untouched.
    #[must_use]
    pub fn fields(&self) -> &[Option<FieldValue>] { &self.values }

    /// Encode the record body (flags, presence bitmap, present values).
    ///
    /// # Errors
    /// Returns [`ProtocolError::IncompleteFullRecord`] if a full record has
    /// unset fields, or [`ProtocolError::FieldTypeMismatch`] if a value does
    /// not match its declared type.
    pub fn encode_body(
        &self,
        definition: &RecordTypeDefinition,
        out: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let mut bitmap: u64 = 0;
        for (index, value) in self.values.iter().enumerate() {
            let Some(present) = value else {
                if !self.delta {
                    return Err(ProtocolError::IncompleteFullRecord);
                }
                continue;
            };
            if !present.matches(definition.field_type_at(index)?) {
                return Err(ProtocolError::FieldTypeMismatch {
                    expected: "declared field type",
                });
            }
            bitmap |= 1 << index;
        }
        out.put_u8(if self.delta { FLAG_DELTA } else { 0 });
        write_varint_u64(out, bitmap);
        for value in self.values.iter().flatten() {
            value.encode(out);
        }
        Ok(())
    }

    /// Decode a record body for the type at `type_index`.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] for malformed bodies, presence bits
    /// beyond the field count, or a full record with missing fields.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "bit counts over a u64 are at most 64"
    )]
    pub fn decode_body(
        type_index: usize,
        definition: &RecordTypeDefinition,
        buf: &mut impl Buf,
    ) -> Result<Self, ProtocolError> {
        let flags = read_u8(buf)?;
        let delta = flags & FLAG_DELTA != 0;
        let bitmap = read_varint_u64(buf)?;
        let count = definition.field_count();

        if count < 64 && bitmap >> count != 0 {
            let bit = 63 - bitmap.leading_zeros() as usize;
            return Err(ProtocolError::PresenceOutOfRange { bit, count });
        }
        if !delta && bitmap.count_ones() as usize != count {
            return Err(ProtocolError::IncompleteFullRecord);
        }

        let mut values = Vec::with_capacity(count);
        for index in 0..count {
            if bitmap & (1 << index) == 0 {
                values.push(None);
                continue;
            }
            let field_type = definition.field_type_at(index)?;
            values.push(Some(FieldValue::decode(field_type, buf)?));
        }
        Ok(Self {
            type_index,
            delta,
            values,
        })
    }
}

/// The retained "current" record for one type, mutated in place as records
/// are materialized.
#[derive(Debug, Clone)]
pub struct MaterializedRecord {
    type_index: usize,
    initialized: bool,
    values: Vec<FieldValue>,
}

impl MaterializedRecord {
    /// Create an uninitialized slot for a record type.
    #[must_use]
    pub fn new(type_index: usize, definition: &RecordTypeDefinition) -> Self {
        Self {
            type_index,
            initialized: false,
            values: definition
                .fields()
                .iter()
                .map(|f| FieldValue::zero_for(f.field_type))
                .collect(),
        }
    }

    /// Index of this slot's record type.
    #[must_use]
    pub const fn type_index(&self) -> usize { self.type_index }

    /// Whether a full record has been applied to this slot.
    #[must_use]
    pub const fn is_initialized(&self) -> bool { self.initialized }

    /// The value at `index`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FieldIndexOutOfRange`] if `index` is out of
    /// range.
    pub fn value(&self, index: usize) -> Result<&FieldValue, ProtocolError> {
        self.values
            .get(index)
            .ok_or_else(|| ProtocolError::FieldIndexOutOfRange {
                index,
                count: self.values.len(),
            })
    }
}

/// Merge a decoded record onto its retained slot.
///
/// A full record overwrites every field and marks the slot initialized. A
/// delta overwrites only the fields it carries; every other field keeps the
/// slot's previous value. The slot copies values out of `record`, so the
/// record's backing buffer may be reused afterwards.
///
/// # Errors
/// Returns [`ProtocolError::DeltaBeforeFull`] when a delta arrives before
/// any full record for the type, and [`ProtocolError::IncompleteFullRecord`]
/// for a full record with unset fields.
pub fn merge_into(slot: &mut MaterializedRecord, record: &Record) -> Result<(), ProtocolError> {
    debug_assert_eq!(slot.type_index, record.type_index(), "slot/record type mixup");
    if record.is_delta() {
        if !slot.initialized {
            return Err(ProtocolError::DeltaBeforeFull(record.type_index()));
        }
        for (held, incoming) in slot.values.iter_mut().zip(record.fields()) {
            if let Some(value) = incoming {
                *held = *value;
            }
        }
    } else {
        for (held, incoming) in slot.values.iter_mut().zip(record.fields()) {
            *held = incoming.ok_or(ProtocolError::IncompleteFullRecord)?;
        }
        slot.initialized = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::schema::{FieldType, RecordTypeDefinition, TimeUnit};

    fn trade_type() -> RecordTypeDefinition {
        RecordTypeDefinition::builder("trade")
            .field("timestamp", FieldType::Timestamp(TimeUnit::Milliseconds))
            .field("volume", FieldType::Long)
            .field("status", FieldType::Byte)
            .build()
            .expect("valid record type")
    }

    fn full_trade(ts: i64, volume: i64, status: u8) -> Record {
        Record::full(
            0,
            vec![
                FieldValue::Timestamp {
                    value: ts,
                    unit: TimeUnit::Milliseconds,
                },
                FieldValue::Long(volume),
                FieldValue::Byte(status),
            ],
        )
    }

    #[rstest]
    fn full_bodies_roundtrip() {
        let definition = trade_type();
        let record = full_trade(12, 250, 3);

        let mut out = BytesMut::new();
        record.encode_body(&definition, &mut out).expect("encode");
        let mut view = out.freeze();
        let decoded = Record::decode_body(0, &definition, &mut view).expect("decode");

        assert_eq!(decoded, record);
        assert!(!view.has_remaining());
    }

    #[rstest]
    fn delta_bodies_carry_only_present_fields() {
        let definition = trade_type();
        let record = Record::delta(0, 3)
            .with_field(1, FieldValue::Long(999))
            .expect("index in range");

        let mut out = BytesMut::new();
        record.encode_body(&definition, &mut out).expect("encode");
        let mut view = out.freeze();
        let decoded = Record::decode_body(0, &definition, &mut view).expect("decode");

        assert!(decoded.is_delta());
        assert_eq!(decoded.fields(), &[None, Some(FieldValue::Long(999)), None]);
    }

    #[rstest]
    fn full_record_with_missing_fields_is_rejected() {
        let definition = trade_type();
        let mut out = BytesMut::new();
        out.put_u8(0); // full
        write_varint_u64(&mut out, 0b101); // field 1 missing
        let mut view = out.freeze();
        assert!(matches!(
            Record::decode_body(0, &definition, &mut view),
            Err(ProtocolError::IncompleteFullRecord)
        ));
    }

    #[rstest]
    fn presence_bits_beyond_field_count_are_rejected() {
        let definition = trade_type();
        let mut out = BytesMut::new();
        out.put_u8(FLAG_DELTA);
        write_varint_u64(&mut out, 1 << 5);
        let mut view = out.freeze();
        assert!(matches!(
            Record::decode_body(0, &definition, &mut view),
            Err(ProtocolError::PresenceOutOfRange { bit: 5, count: 3 })
        ));
    }

    #[rstest]
    fn full_merge_overwrites_and_initializes() {
        let definition = trade_type();
        let mut slot = MaterializedRecord::new(0, &definition);
        assert!(!slot.is_initialized());

        merge_into(&mut slot, &full_trade(7, 10, 1)).expect("merge");

        assert!(slot.is_initialized());
        assert_eq!(slot.value(1).expect("value").as_long().expect("long"), 10);
    }

    #[rstest]
    fn delta_merge_keeps_untouched_fields() {
        let definition = trade_type();
        let mut slot = MaterializedRecord::new(0, &definition);
        merge_into(&mut slot, &full_trade(7, 10, 1)).expect("full merge");

        let delta = Record::delta(0, 3)
            .with_field(2, FieldValue::Byte(9))
            .expect("index in range");
        merge_into(&mut slot, &delta).expect("delta merge");

        assert_eq!(slot.value(1).expect("value").as_long().expect("long"), 10);
        assert_eq!(slot.value(2).expect("value").as_byte().expect("byte"), 9);
        assert_eq!(
            slot.value(0)
                .expect("value")
                .timestamp_in(TimeUnit::Milliseconds)
                .expect("timestamp"),
            7
        );
    }

    #[rstest]
    fn delta_before_full_fails_fast() {
        let definition = trade_type();
        let mut slot = MaterializedRecord::new(0, &definition);
        let delta = Record::delta(0, 3)
            .with_field(1, FieldValue::Long(1))
            .expect("index in range");
        assert!(matches!(
            merge_into(&mut slot, &delta),
            Err(ProtocolError::DeltaBeforeFull(0))
        ));
    }
}
