//! Error types for wire decoding and protocol validation.

use thiserror::Error;
use tokio::io;

use super::msg::OpCode;

/// Errors raised while encoding or decoding protocol data.
///
/// Every variant except [`ProtocolError::Io`] indicates a malformed or
/// inconsistent byte sequence, which is fatal for the connection: it means
/// the client and server disagree about the schema or the framing, not that
/// a transient condition occurred.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer is too short to contain the expected data.
    #[error("buffer too short")]
    ShortBuffer,
    /// A variable-length integer does not terminate within 64 bits.
    #[error("variable-length integer overflows 64 bits")]
    VarintOverflow,
    /// A length or count field exceeds the range of its target type.
    #[error("value {0} out of range for length field")]
    LengthOutOfRange(u64),
    /// The opcode byte does not name a known operation.
    #[error("invalid opcode {0:#04x}")]
    InvalidOpCode(u8),
    /// The field type code does not name a known field type.
    #[error("invalid field type code {0:#04x}")]
    InvalidFieldType(u8),
    /// The partitioning code does not name a known partitioning strategy.
    #[error("invalid partitioning code {0:#04x}")]
    InvalidPartitioning(u8),
    /// Payload size exceeds the configured maximum.
    #[error("payload of {0} bytes exceeds the maximum")]
    PayloadTooLarge(usize),
    /// A record body did not consume exactly its declared length.
    #[error("record body length mismatch")]
    SizeMismatch,
    /// A wire string is not valid UTF-8.
    #[error("invalid UTF-8 in wire string")]
    InvalidUtf8,
    /// A message arrived with an opcode the current operation cannot accept.
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(OpCode),
    /// A record's type index exceeds the known schema's type count.
    #[error("record type index {index} out of range ({known} known types)")]
    UnknownRecordType {
        /// The offending type index.
        index: usize,
        /// Number of record types the schema declares.
        known: usize,
    },
    /// No record type with the given name exists in the schema.
    #[error("unknown record type {0:?}")]
    UnknownRecordTypeName(String),
    /// No field with the given name exists for the record type.
    #[error("unknown field {0:?}")]
    UnknownField(String),
    /// A field index exceeds the record type's field count.
    #[error("field index {index} out of range ({count} fields)")]
    FieldIndexOutOfRange {
        /// The offending field index.
        index: usize,
        /// Number of fields the record type declares.
        count: usize,
    },
    /// A field value was read through an accessor of the wrong type.
    #[error("field value is not a {expected}")]
    FieldTypeMismatch {
        /// Name of the expected field type.
        expected: &'static str,
    },
    /// A delta record arrived before any full record of its type.
    #[error("delta record received before any full record for type {0}")]
    DeltaBeforeFull(usize),
    /// The presence bitmap sets a bit beyond the record type's field count.
    #[error("presence bitmap sets bit {bit} beyond {count} fields")]
    PresenceOutOfRange {
        /// Index of the out-of-range bit.
        bit: usize,
        /// Number of fields the record type declares.
        count: usize,
    },
    /// A full record left one or more fields unset.
    #[error("full record is missing fields")]
    IncompleteFullRecord,
    /// I/O error occurred during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
