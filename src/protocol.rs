//! Wire-level protocol types for the Tidemark client.
//!
//! Every message on a connection is a small envelope (`op | flags | length |
//! payload`) whose payload is encoded with the variable-length primitives in
//! [`wire`]. Record streams are delivered inside data-chunk payloads and are
//! terminated by the reserved [`END_OF_STREAM`] tag byte.

pub mod codec;
pub mod errors;
pub mod msg;
pub mod wire;

pub use codec::MsgCodec;
pub use errors::ProtocolError;
pub use msg::{ErrorPayload, Msg, MsgFlags, MsgHeader, OpCode};

/// Reserved tag byte marking the end of a record stream.
///
/// Record type tags are capped at [`MAX_RECORD_TYPES`], so this value can
/// never collide with a valid tag.
pub const END_OF_STREAM: u8 = 0xFF;

/// Maximum number of record types a series definition may declare.
pub const MAX_RECORD_TYPES: usize = 0x40;

/// Maximum number of fields per record type (presence bitmap width).
pub const MAX_FIELDS: usize = 64;

/// Maximum accepted payload size for a single message.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024; // 4 MiB
