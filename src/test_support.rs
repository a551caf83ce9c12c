//! Scripted in-process servers and byte builders for tests.
//!
//! The scripted server speaks the real codec over an in-memory duplex pipe:
//! for each request it receives, it plays back the next scripted batch of
//! responses, and it hands the received requests back when finished. Tests
//! build record-stream bytes with [`stream_bytes`] and cut them into
//! arbitrary chunk payloads with [`chunk_at`].

#![expect(clippy::expect_used, reason = "test support fails loudly")]

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{DuplexStream, duplex},
    task::JoinHandle,
};
use tokio_util::codec::Framed;

use crate::{
    protocol::{END_OF_STREAM, Msg, MsgCodec, errors::ProtocolError, wire},
    record::Record,
    schema::{FieldType, Partitioning, RecordTypeDefinition, SeriesDefinition, TimeUnit},
};

/// An in-process scripted server endpoint.
pub struct ScriptedServer {
    handle: JoinHandle<Vec<Msg>>,
}

impl ScriptedServer {
    /// Wait for the peer to disconnect and return the requests received, in
    /// arrival order.
    ///
    /// # Panics
    /// Panics if the server task itself panicked.
    pub async fn finish(self) -> Vec<Msg> {
        self.handle.await.expect("scripted server task")
    }
}

/// Spawn a scripted server and return the client-side transport for it.
///
/// `script` holds one batch of responses per expected request; requests
/// beyond the script receive no response (useful for timeout tests).
#[must_use]
pub fn scripted_server(script: Vec<Vec<Msg>>) -> (DuplexStream, ScriptedServer) {
    let (client_io, server_io) = duplex(256 * 1024);
    let handle = tokio::spawn(async move {
        let mut framed = Framed::new(server_io, MsgCodec::new());
        let mut remaining = script.into_iter();
        let mut received = Vec::new();
        while let Some(frame) = framed.next().await {
            let request = frame.expect("request decodes");
            received.push(request);
            if let Some(responses) = remaining.next() {
                for response in responses {
                    framed.send(response).await.expect("response flushes");
                }
            }
        }
        received
    });
    (client_io, ScriptedServer { handle })
}

/// A small two-type series used throughout the integration tests.
///
/// # Panics
/// Panics if the built-in definition is invalid.
#[must_use]
pub fn sample_series() -> SeriesDefinition {
    let trade = RecordTypeDefinition::builder("trade")
        .field("timestamp", FieldType::Timestamp(TimeUnit::Milliseconds))
        .field("price", FieldType::Decimal)
        .field("volume", FieldType::Long)
        .field("status", FieldType::Byte)
        .build()
        .expect("valid record type");
    let quote = RecordTypeDefinition::builder("quote")
        .field("timestamp", FieldType::Timestamp(TimeUnit::Milliseconds))
        .field("bid", FieldType::Double)
        .field("ask", FieldType::Double)
        .build()
        .expect("valid record type");
    SeriesDefinition::builder("ticks")
        .partitioning(Partitioning::ByDay)
        .record_type(trade)
        .record_type(quote)
        .build()
        .expect("valid series")
}

/// Encode records into one logical record stream, sentinel included.
///
/// # Errors
/// Returns a [`ProtocolError`] if a record does not match the definition.
pub fn stream_bytes(
    definition: &SeriesDefinition,
    records: &[Record],
) -> Result<Bytes, ProtocolError> {
    let mut out = BytesMut::new();
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
    out.put_u8(END_OF_STREAM);
    Ok(out.freeze())
}

/// Cut a byte sequence at the given ascending offsets into chunk payloads.
#[must_use]
pub fn chunk_at(bytes: &Bytes, splits: &[usize]) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut last = 0;
    for &split in splits {
        chunks.push(bytes.slice(last..split));
        last = split;
    }
    chunks.push(bytes.slice(last..));
    chunks
}

/// Wrap record-stream bytes into data-chunk responses, one per cut.
///
/// # Errors
/// Propagates [`stream_bytes`] failures.
pub fn chunked_data_messages(
    definition: &SeriesDefinition,
    records: &[Record],
    splits: &[usize],
) -> Result<Vec<Msg>, ProtocolError> {
    let bytes = stream_bytes(definition, records)?;
    Ok(chunk_at(&bytes, splits)
        .into_iter()
        .map(Msg::data_chunk)
        .collect())
}

/// A data-header response announcing a stream of `definition` records.
#[must_use]
pub fn data_header(definition: &SeriesDefinition) -> Msg {
    Msg::response(crate::protocol::OpCode::DataHeader, definition.encode_to_bytes())
}
