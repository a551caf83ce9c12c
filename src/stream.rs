//! Chunk-spanning record stream decoding.
//!
//! A query result arrives as a sequence of data-chunk payloads whose bytes
//! concatenate into one logical record stream: `tag | varint length | body`
//! repeated, terminated by the end-of-stream sentinel. Record boundaries do
//! not align with chunk boundaries, so the decoder keeps a carry-over buffer
//! and fetches further chunks whenever a tag, length, or body is cut short.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use tracing::warn;

use crate::{
    errors::ClientError,
    protocol::{END_OF_STREAM, OpCode, errors::ProtocolError, wire},
    record::Record,
    recordset::RecordSource,
    schema::SeriesDefinition,
};

/// Source of chunk payloads for a record stream.
#[async_trait]
pub trait ChunkFetch: Send {
    /// Fetch the next chunk payload from the transport.
    ///
    /// # Errors
    /// Propagates transport, protocol, and server failures.
    async fn next_chunk(&mut self) -> Result<Bytes, ClientError>;
}

/// Outcome of one decode attempt over the buffered bytes.
enum DecodeStep {
    /// A whole record was consumed from the buffer.
    Record(Record),
    /// The sentinel was consumed; the stream is finished.
    EndOfStream,
    /// The buffered bytes end mid-tag, mid-length, or mid-body.
    NeedChunk,
}

/// Lazily decodes records out of a sequence of chunks.
///
/// `fetch_next` is memoized: repeated calls without [`RecordStream::take`]
/// decode nothing further. Once the sentinel has been observed no more
/// chunks are fetched.
pub struct RecordStream<C> {
    definition: Arc<SeriesDefinition>,
    chunks: C,
    buf: BytesMut,
    pending: Option<Record>,
    done: bool,
}

impl<C: ChunkFetch> RecordStream<C> {
    /// Create a stream decoding `chunks` against `definition`.
    #[must_use]
    pub fn new(definition: Arc<SeriesDefinition>, chunks: C) -> Self {
        Self {
            definition,
            chunks,
            buf: BytesMut::new(),
            pending: None,
            done: false,
        }
    }

    /// Decode until a record is ready, the stream ends, or an error occurs.
    /// Returns whether a record is now ready for [`RecordStream::take`].
    ///
    /// # Errors
    /// Propagates chunk-fetch failures and protocol violations; both are
    /// fatal for the stream.
    pub async fn fetch_next(&mut self) -> Result<bool, ClientError> {
        if self.done {
            return Ok(false);
        }
        if self.pending.is_some() {
            return Ok(true);
        }
        loop {
            match self.try_decode()? {
                DecodeStep::Record(record) => {
                    self.pending = Some(record);
                    return Ok(true);
                }
                DecodeStep::EndOfStream => {
                    self.done = true;
                    self.buf.clear();
                    return Ok(false);
                }
                DecodeStep::NeedChunk => {
                    let chunk = self.chunks.next_chunk().await?;
                    self.buf.extend_from_slice(&chunk);
                }
            }
        }
    }

    /// Return the record made ready by [`RecordStream::fetch_next`].
    ///
    /// # Errors
    /// Returns [`ClientError::IllegalState`] if no record is ready.
    pub fn take(&mut self) -> Result<Record, ClientError> {
        self.pending.take().ok_or(ClientError::IllegalState(
            "no record is ready; call fetch_next first",
        ))
    }

    /// Whether the end-of-stream sentinel has been observed.
    #[must_use]
    pub const fn is_done(&self) -> bool { self.done }

    /// Release the stream. Intentionally sends no cancellation signal to the
    /// server (the protocol has none); closing with an undrained stream is
    /// not an error.
    pub fn close(&mut self) {
        if self.done {
            return;
        }
        warn!("record stream closed before the end-of-stream marker");
        self.done = true;
        self.pending = None;
        self.buf.clear();
    }

    /// Attempt to decode one record from the buffered bytes without
    /// consuming anything until the whole record is present.
    fn try_decode(&mut self) -> Result<DecodeStep, ClientError> {
        let mut view: &[u8] = self.buf.as_ref();
        if view.is_empty() {
            return Ok(DecodeStep::NeedChunk);
        }
        let before = view.len();

        let tag = wire::read_u8(&mut view).map_err(ClientError::from_wire)?;
        if tag == END_OF_STREAM {
            self.buf.advance(1);
            return Ok(DecodeStep::EndOfStream);
        }
        let type_index = usize::from(tag);
        let record_type = self.definition.record_type(type_index)?;

        let body_len = match wire::read_len(&mut view) {
            Err(ProtocolError::ShortBuffer) => return Ok(DecodeStep::NeedChunk),
            other => other?,
        };
        if view.len() < body_len {
            return Ok(DecodeStep::NeedChunk);
        }

        let header_len = before - view.len();
        self.buf.advance(header_len);
        let mut body = self.buf.split_to(body_len).freeze();
        let record = Record::decode_body(type_index, record_type, &mut body)?;
        if body.has_remaining() {
            return Err(ClientError::Protocol(ProtocolError::SizeMismatch));
        }
        Ok(DecodeStep::Record(record))
    }
}

#[async_trait]
impl<C: ChunkFetch> RecordSource for RecordStream<C> {
    async fn next_record(&mut self) -> Result<Option<Record>, ClientError> {
        if self.fetch_next().await? {
            self.take().map(Some)
        } else {
            Ok(None)
        }
    }

    fn close(&mut self) { Self::close(self) }
}

/// Chunk source draining data-chunk responses from an exclusively held
/// connection.
///
/// The guard keeps the connection locked for the lifetime of the stream, so
/// no other request can interleave with an undrained result.
pub struct ConnectionChunks {
    conn: tokio::sync::OwnedMutexGuard<crate::connection::Connection>,
}

impl ConnectionChunks {
    pub(crate) fn new(conn: tokio::sync::OwnedMutexGuard<crate::connection::Connection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ChunkFetch for ConnectionChunks {
    async fn next_chunk(&mut self) -> Result<Bytes, ClientError> {
        let msg = self.conn.await_response().await?;
        match msg.op() {
            OpCode::DataChunk => Ok(msg.payload),
            other => Err(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                other,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::BufMut;
    use rstest::rstest;

    use super::*;
    use crate::{
        record::FieldValue,
        schema::{FieldType, RecordTypeDefinition, TimeUnit},
    };

    /// Chunk source over pre-cut chunks, counting fetches.
    struct CannedChunks {
        chunks: VecDeque<Bytes>,
        fetches: usize,
    }

    impl CannedChunks {
        fn new(chunks: Vec<Bytes>) -> Self {
            Self {
                chunks: chunks.into(),
                fetches: 0,
            }
        }
    }

    #[async_trait]
    impl ChunkFetch for CannedChunks {
        async fn next_chunk(&mut self) -> Result<Bytes, ClientError> {
            self.fetches += 1;
            self.chunks.pop_front().ok_or(ClientError::IllegalState(
                "no further chunks scripted",
            ))
        }
    }

    fn tick_series() -> Arc<SeriesDefinition> {
        let trade = RecordTypeDefinition::builder("trade")
            .field("timestamp", FieldType::Timestamp(TimeUnit::Milliseconds))
            .field("volume", FieldType::Long)
            .build()
            .expect("valid record type");
        Arc::new(
            SeriesDefinition::builder("ticks")
                .record_type(trade)
                .build()
                .expect("valid series"),
        )
    }

    fn full_trade(ts: i64, volume: i64) -> Record {
        Record::full(
            0,
            vec![
                FieldValue::Timestamp {
                    value: ts,
                    unit: TimeUnit::Milliseconds,
                },
                FieldValue::Long(volume),
            ],
        )
    }

    fn stream_bytes(definition: &SeriesDefinition, records: &[Record]) -> Bytes {
        let mut out = BytesMut::new();
        for record in records {
            let record_type = definition
                .record_type(record.type_index())
                .expect("known type");
            let mut body = BytesMut::new();
            record.encode_body(record_type, &mut body).expect("encode");
            out.put_u8(u8::try_from(record.type_index()).expect("tag fits"));
            wire::write_len(&mut out, body.len());
            out.extend_from_slice(&body);
        }
        out.put_u8(END_OF_STREAM);
        out.freeze()
    }

    fn cut(bytes: &Bytes, splits: &[usize]) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        let mut last = 0;
        for &split in splits {
            chunks.push(bytes.slice(last..split));
            last = split;
        }
        chunks.push(bytes.slice(last..));
        chunks
    }

    async fn decode_all<C: ChunkFetch>(stream: &mut RecordStream<C>) -> Vec<Record> {
        let mut records = Vec::new();
        while stream.fetch_next().await.expect("fetch") {
            records.push(stream.take().expect("ready record"));
        }
        records
    }

    #[rstest]
    #[tokio::test]
    async fn single_chunk_stream_decodes_in_order() {
        let definition = tick_series();
        let records = vec![full_trade(1, 10), full_trade(2, 20), full_trade(3, 30)];
        let bytes = stream_bytes(&definition, &records);

        let mut stream =
            RecordStream::new(definition, CannedChunks::new(vec![bytes]));
        assert_eq!(decode_all(&mut stream).await, records);
        assert!(stream.is_done());
    }

    #[rstest]
    #[tokio::test]
    async fn split_between_tag_and_length_is_transparent() {
        // Three full records of type 0 across two chunks, split between
        // record 2's tag byte and its length byte, sentinel in chunk 2.
        let definition = tick_series();
        let records = vec![full_trade(1, 10), full_trade(2, 20), full_trade(3, 30)];
        let bytes = stream_bytes(&definition, &records);

        let first = definition.record_type(0).expect("type");
        let mut body = BytesMut::new();
        records
            .first()
            .expect("record")
            .encode_body(first, &mut body)
            .expect("encode");
        // one record = tag + 1-byte length + body; cut right after the
        // second record's tag byte
        let split_at = (2 + body.len()) + 1;

        let mut stream = RecordStream::new(
            definition,
            CannedChunks::new(cut(&bytes, &[split_at])),
        );
        assert_eq!(decode_all(&mut stream).await, records);
        assert!(stream.is_done());
    }

    #[rstest]
    #[tokio::test]
    async fn every_split_offset_yields_the_same_records() {
        let definition = tick_series();
        let records = vec![full_trade(-5, 1), full_trade(6, -2), full_trade(7, 300)];
        let bytes = stream_bytes(&definition, &records);

        for offset in 1..bytes.len() {
            let mut stream = RecordStream::new(
                definition.clone(),
                CannedChunks::new(cut(&bytes, &[offset])),
            );
            assert_eq!(decode_all(&mut stream).await, records, "split at {offset}");
        }
    }

    #[rstest]
    #[tokio::test]
    async fn end_of_stream_is_memoized_without_further_fetches() {
        let definition = tick_series();
        let bytes = stream_bytes(&definition, &[]);

        let mut stream = RecordStream::new(definition, CannedChunks::new(vec![bytes]));
        assert!(!stream.fetch_next().await.expect("fetch"));
        let fetches_after_end = stream.chunks.fetches;
        for _ in 0..3 {
            assert!(!stream.fetch_next().await.expect("fetch"));
        }
        assert_eq!(stream.chunks.fetches, fetches_after_end);
    }

    #[rstest]
    #[tokio::test]
    async fn fetch_next_is_memoized_until_take() {
        let definition = tick_series();
        let bytes = stream_bytes(&definition, &[full_trade(1, 10)]);

        let mut stream = RecordStream::new(definition, CannedChunks::new(vec![bytes]));
        assert!(stream.fetch_next().await.expect("fetch"));
        assert!(stream.fetch_next().await.expect("fetch"));
        let record = stream.take().expect("ready record");
        assert_eq!(record, full_trade(1, 10));
        assert!(matches!(
            stream.take(),
            Err(ClientError::IllegalState(_))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn take_before_fetch_is_illegal() {
        let definition = tick_series();
        let mut stream = RecordStream::new(definition, CannedChunks::new(Vec::new()));
        assert!(matches!(
            stream.take(),
            Err(ClientError::IllegalState(_))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_tag_is_fatal() {
        let definition = tick_series();
        let mut out = BytesMut::new();
        out.put_u8(0x05); // no record type 5 in the schema
        wire::write_len(&mut out, 0);
        out.put_u8(END_OF_STREAM);

        let mut stream = RecordStream::new(
            definition,
            CannedChunks::new(vec![out.freeze()]),
        );
        let err = stream.fetch_next().await.expect_err("schema mismatch");
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::UnknownRecordType { index: 5, known: 1 })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn exhausted_chunk_followed_by_sentinel_only_chunk() {
        let definition = tick_series();
        let records = vec![full_trade(1, 10)];
        let bytes = stream_bytes(&definition, &records);
        let sentinel_at = bytes.len() - 1;

        let mut stream = RecordStream::new(
            definition,
            CannedChunks::new(cut(&bytes, &[sentinel_at])),
        );
        assert_eq!(decode_all(&mut stream).await, records);
        assert!(stream.is_done());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Decoding a stream split at arbitrary offsets yields the same
            /// record sequence as decoding it whole.
            #[test]
            fn chunking_is_transparent(
                volumes in proptest::collection::vec(any::<i64>(), 1..8),
                raw_splits in proptest::collection::vec(any::<prop::sample::Index>(), 0..4),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .expect("runtime");
                rt.block_on(async move {
                    let definition = tick_series();
                    let records: Vec<Record> = volumes
                        .iter()
                        .enumerate()
                        .map(|(seq, &volume)| {
                            full_trade(i64::try_from(seq).expect("small"), volume)
                        })
                        .collect();
                    let bytes = stream_bytes(&definition, &records);

                    let mut offsets: Vec<usize> = raw_splits
                        .iter()
                        .map(|index| index.index(bytes.len()))
                        .collect();
                    offsets.sort_unstable();
                    offsets.dedup();

                    let mut stream = RecordStream::new(
                        definition,
                        CannedChunks::new(cut(&bytes, &offsets)),
                    );
                    let decoded = decode_all(&mut stream).await;
                    assert_eq!(decoded, records);
                    assert!(stream.is_done());
                });
            }
        }
    }
}
