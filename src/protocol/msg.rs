//! The message envelope: opcode, flags, and an opaque typed payload.
//!
//! Correlation between requests and responses is positional. A channel only
//! ever has one request outstanding, so responses are matched to requests by
//! arrival order and the envelope carries no request identifier.

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

use super::{
    errors::ProtocolError,
    wire::{read_str, read_varint_i32, write_str, write_varint_i32},
};

bitflags! {
    /// Header flags carried by every message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// Set on messages travelling server to client.
        const RESPONSE = 0b0000_0001;
        /// Clear on a response reporting a server-side failure.
        const SUCCESS = 0b0000_0010;
    }
}

/// Operation code identifying what a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// No-op; used by liveness probes.
    Noop,
    /// Structured error descriptor (responses flagged unsuccessful).
    Error,
    /// Server acknowledgement that the session's database changed.
    UseDatabase,
    /// Opaque query text to execute.
    Query,
    /// One atomic write batch for a single partition.
    BulkWrite,
    /// Announces a record stream and carries its series definition.
    DataHeader,
    /// One chunk of a record stream.
    DataChunk,
    /// Request for a series definition by name.
    GetSeries,
    /// Request to create a series from an inline definition.
    CreateSeries,
    /// Empty acknowledgement.
    Ack,
}

impl OpCode {
    /// Decode an opcode byte.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidOpCode`] for unassigned values.
    pub const fn from_u8(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(Self::Noop),
            1 => Ok(Self::Error),
            2 => Ok(Self::UseDatabase),
            3 => Ok(Self::Query),
            4 => Ok(Self::BulkWrite),
            5 => Ok(Self::DataHeader),
            6 => Ok(Self::DataChunk),
            7 => Ok(Self::GetSeries),
            8 => Ok(Self::CreateSeries),
            9 => Ok(Self::Ack),
            other => Err(ProtocolError::InvalidOpCode(other)),
        }
    }

    /// Encode the opcode as its wire byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Noop => 0,
            Self::Error => 1,
            Self::UseDatabase => 2,
            Self::Query => 3,
            Self::BulkWrite => 4,
            Self::DataHeader => 5,
            Self::DataChunk => 6,
            Self::GetSeries => 7,
            Self::CreateSeries => 8,
            Self::Ack => 9,
        }
    }
}

/// Parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Operation code.
    pub op: OpCode,
    /// Header flags.
    pub flags: MsgFlags,
}

/// One request or response unit on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    /// Envelope header.
    pub header: MsgHeader,
    /// Opaque payload; its shape is determined by the opcode.
    pub payload: Bytes,
}

impl Msg {
    /// Build a request message.
    #[must_use]
    pub fn request(op: OpCode, payload: Bytes) -> Self {
        Self {
            header: MsgHeader {
                op,
                flags: MsgFlags::SUCCESS,
            },
            payload,
        }
    }

    /// Build a successful response message.
    #[must_use]
    pub fn response(op: OpCode, payload: Bytes) -> Self {
        Self {
            header: MsgHeader {
                op,
                flags: MsgFlags::RESPONSE | MsgFlags::SUCCESS,
            },
            payload,
        }
    }

    /// Build an error response carrying a structured error descriptor.
    #[must_use]
    pub fn error_response(code: i32, message: &str) -> Self {
        Self {
            header: MsgHeader {
                op: OpCode::Error,
                flags: MsgFlags::RESPONSE,
            },
            payload: ErrorPayload {
                code,
                message: message.to_owned(),
            }
            .encode(),
        }
    }

    /// Build a query request.
    #[must_use]
    pub fn query(database: &str, text: &str) -> Self {
        let mut buf = BytesMut::new();
        write_str(&mut buf, database);
        write_str(&mut buf, text);
        Self::request(OpCode::Query, buf.freeze())
    }

    /// Parse a query payload into `(database, text)`.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the payload is malformed.
    pub fn query_payload(&self) -> Result<(String, String), ProtocolError> {
        let mut view = self.payload.clone();
        let database = read_str(&mut view)?;
        let text = read_str(&mut view)?;
        Ok((database, text))
    }

    /// Build a `UseDatabase` response naming the session's database.
    #[must_use]
    pub fn use_database(database: &str) -> Self {
        let mut buf = BytesMut::new();
        write_str(&mut buf, database);
        Self::response(OpCode::UseDatabase, buf.freeze())
    }

    /// Parse a `UseDatabase` payload into the database name.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the payload is malformed.
    pub fn database_payload(&self) -> Result<String, ProtocolError> {
        let mut view = self.payload.clone();
        read_str(&mut view)
    }

    /// Build a data-chunk response from raw record-stream bytes.
    #[must_use]
    pub fn data_chunk(bytes: Bytes) -> Self { Self::response(OpCode::DataChunk, bytes) }

    /// Parse the structured error descriptor out of an error response.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the payload is malformed.
    pub fn error_payload(&self) -> Result<ErrorPayload, ProtocolError> {
        ErrorPayload::decode(&self.payload)
    }

    /// Operation code of this message.
    #[must_use]
    pub const fn op(&self) -> OpCode { self.header.op }

    /// Whether this message travels server to client.
    #[must_use]
    pub const fn is_response(&self) -> bool { self.header.flags.contains(MsgFlags::RESPONSE) }

    /// Whether a response reports success.
    #[must_use]
    pub const fn is_success(&self) -> bool { self.header.flags.contains(MsgFlags::SUCCESS) }
}

/// Structured error descriptor carried by unsuccessful responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Server-assigned numeric error code, passed through unmodified.
    pub code: i32,
    /// Human-readable error text.
    pub message: String,
}

impl ErrorPayload {
    /// Encode the descriptor into payload bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_varint_i32(&mut buf, self.code);
        write_str(&mut buf, &self.message);
        buf.freeze()
    }

    /// Decode a descriptor from payload bytes.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the payload is malformed.
    pub fn decode(payload: &Bytes) -> Result<Self, ProtocolError> {
        let mut view = payload.clone();
        let code = read_varint_i32(&mut view)?;
        let message = read_str(&mut view)?;
        Ok(Self { code, message })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn opcodes_roundtrip() {
        for raw in 0u8..=9 {
            let op = OpCode::from_u8(raw).expect("assigned opcode");
            assert_eq!(op.as_u8(), raw);
        }
    }

    #[rstest]
    fn unassigned_opcode_is_rejected() {
        assert!(matches!(
            OpCode::from_u8(0x7E),
            Err(ProtocolError::InvalidOpCode(0x7E))
        ));
    }

    #[rstest]
    fn query_payload_roundtrips() {
        let msg = Msg::query("metrics", "SELECT * FROM trades;");
        assert_eq!(msg.op(), OpCode::Query);
        assert!(msg.is_success());
        assert!(!msg.is_response());
        let (database, text) = msg.query_payload().expect("payload");
        assert_eq!(database, "metrics");
        assert_eq!(text, "SELECT * FROM trades;");
    }

    #[rstest]
    fn error_response_is_flagged_unsuccessful() {
        let msg = Msg::error_response(42, "partition is locked");
        assert!(msg.is_response());
        assert!(!msg.is_success());
        let payload = msg.error_payload().expect("payload");
        assert_eq!(payload.code, 42);
        assert_eq!(payload.message, "partition is locked");
    }
}
