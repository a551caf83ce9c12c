//! Cursor-style record sets.
//!
//! A [`RecordSet`] drains a [`RecordSource`] one record at a time. Only the
//! most recently produced record is readable; each decoded record is merged
//! onto the retained per-type slot before the accessors see it, so deltas
//! are transparent to callers. Reading before the first [`RecordSet::advance`],
//! after exhaustion, or after [`RecordSet::close`] is an illegal state.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    errors::ClientError,
    protocol::errors::ProtocolError,
    record::{FieldValue, MaterializedRecord, Record, merge_into},
    schema::{FieldRef, SeriesDefinition, TimeUnit},
};

/// The per-type "current record" slots owned by one record set.
#[derive(Debug)]
pub(crate) struct Slots {
    slots: Vec<MaterializedRecord>,
}

impl Slots {
    pub(crate) fn new(definition: &SeriesDefinition) -> Self {
        Self {
            slots: definition
                .record_types()
                .iter()
                .enumerate()
                .map(|(index, record_type)| MaterializedRecord::new(index, record_type))
                .collect(),
        }
    }

    /// Merge a record onto its slot and return the slot's type index.
    pub(crate) fn apply(&mut self, record: &Record) -> Result<usize, ProtocolError> {
        let index = record.type_index();
        let known = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(ProtocolError::UnknownRecordType { index, known })?;
        merge_into(slot, record)?;
        Ok(index)
    }

    fn slot(&self, index: usize) -> Result<&MaterializedRecord, ProtocolError> {
        self.slots
            .get(index)
            .ok_or_else(|| ProtocolError::UnknownRecordType {
                index,
                known: self.slots.len(),
            })
    }
}

/// A sequential source of decoded records.
#[async_trait]
pub trait RecordSource: Send {
    /// Produce the next record, or `None` once the source is exhausted.
    ///
    /// # Errors
    /// Propagates transport, protocol, and server failures.
    async fn next_record(&mut self) -> Result<Option<Record>, ClientError>;

    /// Release any held resources. Must be idempotent.
    fn close(&mut self) {}
}

#[async_trait]
impl RecordSource for Box<dyn RecordSource + Send> {
    async fn next_record(&mut self) -> Result<Option<Record>, ClientError> {
        (**self).next_record().await
    }

    fn close(&mut self) { (**self).close() }
}

/// A source with no records.
#[derive(Debug, Default)]
pub struct EmptySource;

#[async_trait]
impl RecordSource for EmptySource {
    async fn next_record(&mut self) -> Result<Option<Record>, ClientError> { Ok(None) }
}

/// A source over an in-memory list of records.
#[derive(Debug)]
pub struct VecSource {
    records: Vec<Record>,
    position: usize,
}

impl VecSource {
    /// Wrap a list of records.
    #[must_use]
    pub const fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            position: 0,
        }
    }

    /// Number of records already produced.
    pub(crate) const fn position(&self) -> usize { self.position }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn next_record(&mut self) -> Result<Option<Record>, ClientError> {
        let next = self.records.get(self.position).cloned();
        if next.is_some() {
            self.position += 1;
        }
        Ok(next)
    }
}

/// Cursor over a sequence of records with per-field accessors.
pub struct RecordSet<S = Box<dyn RecordSource + Send>> {
    definition: Arc<SeriesDefinition>,
    source: S,
    slots: Slots,
    current_type: Option<usize>,
    exhausted: bool,
    closed: bool,
}

impl RecordSet {
    /// A record set over no records, as produced by operations that return
    /// nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Arc::new(SeriesDefinition::empty()), Box::new(EmptySource))
    }
}

impl<S: RecordSource> RecordSet<S> {
    /// Create a record set draining `source` under `definition`.
    #[must_use]
    pub fn new(definition: Arc<SeriesDefinition>, source: S) -> Self {
        let slots = Slots::new(&definition);
        Self {
            definition,
            source,
            slots,
            current_type: None,
            exhausted: false,
            closed: false,
        }
    }

    /// The definition this record set decodes against.
    #[must_use]
    pub fn definition(&self) -> &SeriesDefinition { &self.definition }

    /// Move to the next record. Returns `false` once the set is exhausted.
    ///
    /// # Errors
    /// Returns [`ClientError::IllegalState`] after [`RecordSet::close`], and
    /// propagates source failures.
    pub async fn advance(&mut self) -> Result<bool, ClientError> {
        if self.closed {
            return Err(ClientError::IllegalState("the record set has been closed"));
        }
        if self.exhausted {
            return Ok(false);
        }
        match self.source.next_record().await {
            Ok(Some(record)) => {
                self.current_type = Some(self.slots.apply(&record)?);
                Ok(true)
            }
            Ok(None) => {
                self.exhausted = true;
                Ok(false)
            }
            Err(err) => {
                self.exhausted = true;
                Err(err)
            }
        }
    }

    /// Collect every not-yet-consumed record without materializing them.
    ///
    /// # Errors
    /// Propagates source failures.
    pub async fn collect_remaining(&mut self) -> Result<Vec<Record>, ClientError> {
        if self.closed {
            return Err(ClientError::IllegalState("the record set has been closed"));
        }
        let mut records = Vec::new();
        while let Some(record) = self.source.next_record().await? {
            records.push(record);
        }
        self.exhausted = true;
        Ok(records)
    }

    /// Type index of the current record.
    ///
    /// # Errors
    /// Returns [`ClientError::IllegalState`] if no record is readable.
    pub fn record_type(&self) -> Result<usize, ClientError> {
        self.current().map(MaterializedRecord::type_index)
    }

    /// Read a long field, widening smaller integers.
    ///
    /// # Errors
    /// Returns [`ClientError::IllegalState`] if no record is readable, and a
    /// protocol violation for unknown fields or mismatched types.
    pub fn get_long<'a>(&self, field: impl Into<FieldRef<'a>>) -> Result<i64, ClientError> {
        Ok(self.field_value(field.into())?.as_long()?)
    }

    /// Read an int field, widening bytes.
    ///
    /// # Errors
    /// See [`RecordSet::get_long`].
    pub fn get_int<'a>(&self, field: impl Into<FieldRef<'a>>) -> Result<i32, ClientError> {
        Ok(self.field_value(field.into())?.as_int()?)
    }

    /// Read a byte field.
    ///
    /// # Errors
    /// See [`RecordSet::get_long`].
    pub fn get_byte<'a>(&self, field: impl Into<FieldRef<'a>>) -> Result<u8, ClientError> {
        Ok(self.field_value(field.into())?.as_byte()?)
    }

    /// Read a double field.
    ///
    /// # Errors
    /// See [`RecordSet::get_long`].
    pub fn get_double<'a>(&self, field: impl Into<FieldRef<'a>>) -> Result<f64, ClientError> {
        Ok(self.field_value(field.into())?.as_double()?)
    }

    /// Read a decimal field's mantissa.
    ///
    /// # Errors
    /// See [`RecordSet::get_long`].
    pub fn get_decimal_mantissa<'a>(
        &self,
        field: impl Into<FieldRef<'a>>,
    ) -> Result<i64, ClientError> {
        Ok(self.field_value(field.into())?.decimal_mantissa()?)
    }

    /// Read a decimal field's exponent.
    ///
    /// # Errors
    /// See [`RecordSet::get_long`].
    pub fn get_decimal_exponent<'a>(
        &self,
        field: impl Into<FieldRef<'a>>,
    ) -> Result<i32, ClientError> {
        Ok(self.field_value(field.into())?.decimal_exponent()?)
    }

    /// Read a timestamp field converted into `unit`.
    ///
    /// # Errors
    /// See [`RecordSet::get_long`].
    pub fn get_timestamp_in<'a>(
        &self,
        field: impl Into<FieldRef<'a>>,
        unit: TimeUnit,
    ) -> Result<i64, ClientError> {
        Ok(self.field_value(field.into())?.timestamp_in(unit)?)
    }

    /// Close the record set. Idempotent; never raises.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.source.close();
    }

    pub(crate) const fn source(&self) -> &S { &self.source }

    fn current(&self) -> Result<&MaterializedRecord, ClientError> {
        if self.closed {
            return Err(ClientError::IllegalState("the record set has been closed"));
        }
        if self.exhausted {
            return Err(ClientError::IllegalState(
                "all records of the record set have been read",
            ));
        }
        let Some(type_index) = self.current_type else {
            return Err(ClientError::IllegalState(
                "advance must be called before reading fields",
            ));
        };
        Ok(self.slots.slot(type_index)?)
    }

    fn field_value(&self, field: FieldRef<'_>) -> Result<&FieldValue, ClientError> {
        let record = self.current()?;
        let index = self
            .definition
            .field_index(record.type_index(), field)?;
        Ok(record.value(index)?)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        record::FieldValue,
        schema::{FieldType, RecordTypeDefinition},
    };

    fn tick_series() -> Arc<SeriesDefinition> {
        let trade = RecordTypeDefinition::builder("trade")
            .field("timestamp", FieldType::Timestamp(TimeUnit::Milliseconds))
            .field("volume", FieldType::Long)
            .field("status", FieldType::Byte)
            .build()
            .expect("valid record type");
        Arc::new(
            SeriesDefinition::builder("ticks")
                .record_type(trade)
                .build()
                .expect("valid series"),
        )
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

    fn delta_volume(volume: i64) -> Record {
        Record::delta(0, 3)
            .with_field(1, FieldValue::Long(volume))
            .expect("index in range")
    }

    #[rstest]
    fn reading_before_advance_is_illegal() {
        let set = RecordSet::new(tick_series(), VecSource::new(vec![full_trade(1, 2, 3)]));
        assert!(matches!(
            set.get_long("volume"),
            Err(ClientError::IllegalState(_))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn deltas_overlay_the_previous_full_record() {
        let records = vec![full_trade(10, 100, 1), delta_volume(250), delta_volume(300)];
        let mut set = RecordSet::new(tick_series(), VecSource::new(records));

        assert!(set.advance().await.expect("advance"));
        assert_eq!(set.get_long("volume").expect("volume"), 100);

        assert!(set.advance().await.expect("advance"));
        assert_eq!(set.get_long("volume").expect("volume"), 250);
        assert_eq!(set.get_byte("status").expect("status"), 1);
        assert_eq!(
            set.get_timestamp_in("timestamp", TimeUnit::Milliseconds)
                .expect("timestamp"),
            10
        );

        assert!(set.advance().await.expect("advance"));
        assert_eq!(set.get_long("volume").expect("volume"), 300);

        assert!(!set.advance().await.expect("advance"));
        assert!(matches!(
            set.get_long("volume"),
            Err(ClientError::IllegalState(_))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_type_index_is_a_hard_error() {
        let records = vec![full_trade(1, 2, 3)];
        let stray = Record::full(
            7,
            vec![FieldValue::Timestamp {
                value: 0,
                unit: TimeUnit::Milliseconds,
            }],
        );
        let mut set = RecordSet::new(
            tick_series(),
            VecSource::new(vec![records.into_iter().next().expect("record"), stray]),
        );

        assert!(set.advance().await.expect("advance"));
        let err = set.advance().await.expect_err("schema mismatch");
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::UnknownRecordType { index: 7, known: 1 })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn delta_before_full_is_a_hard_error() {
        let mut set = RecordSet::new(tick_series(), VecSource::new(vec![delta_volume(1)]));
        let err = set.advance().await.expect_err("delta before full");
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::DeltaBeforeFull(0))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn close_is_idempotent_and_blocks_reads() {
        let mut set = RecordSet::new(tick_series(), VecSource::new(vec![full_trade(1, 2, 3)]));
        assert!(set.advance().await.expect("advance"));
        set.close();
        set.close();
        assert!(matches!(
            set.get_long("volume"),
            Err(ClientError::IllegalState(_))
        ));
        assert!(matches!(
            set.advance().await,
            Err(ClientError::IllegalState(_))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_field_name_is_reported() {
        let mut set = RecordSet::new(tick_series(), VecSource::new(vec![full_trade(1, 2, 3)]));
        assert!(set.advance().await.expect("advance"));
        assert!(matches!(
            set.get_long("missing"),
            Err(ClientError::Protocol(ProtocolError::UnknownField(_)))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn collect_remaining_returns_raw_records_in_order() {
        let records = vec![full_trade(1, 10, 0), delta_volume(20), full_trade(2, 30, 1)];
        let mut set = RecordSet::new(tick_series(), VecSource::new(records.clone()));

        assert!(set.advance().await.expect("advance"));
        let rest = set.collect_remaining().await.expect("collect");
        assert_eq!(rest, records.get(1..).expect("tail"));

        assert!(!set.advance().await.expect("advance"));
    }

    #[rstest]
    #[tokio::test]
    async fn empty_record_set_reports_no_rows() {
        let mut set = RecordSet::empty();
        assert!(!set.advance().await.expect("advance"));
    }
}
