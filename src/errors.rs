//! Client-visible failure surface.

use std::time::Duration;

use thiserror::Error;
use tokio::io;

use crate::{protocol::ProtocolError, schema::SchemaError};

/// Errors surfaced by client operations.
///
/// The taxonomy separates transient conditions a caller may retry
/// ([`ClientError::Timeout`]) from connection-fatal ones
/// ([`ClientError::Transport`], [`ClientError::Protocol`]) and from plain
/// programming errors ([`ClientError::IllegalState`]). Server-reported
/// failures keep the server's numeric code unmodified for inspection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The underlying transport failed; the connection is unusable.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),
    /// No response was delivered within the allowed time.
    #[error("no response received within {0:?}")]
    Timeout(Duration),
    /// The server reported a failure for the request.
    #[error("[server error {code}] {message}")]
    Server {
        /// Server-assigned numeric error code, passed through unmodified.
        code: i32,
        /// Human-readable error text from the server.
        message: String,
    },
    /// The byte stream violated the protocol; never retried.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    /// A schema definition or partitioning input was invalid.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    /// An operation was invoked in a state that forbids it.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl ClientError {
    /// Classify a wire-layer error: I/O failures are transport-fatal, all
    /// other decode failures are protocol violations.
    #[must_use]
    pub fn from_wire(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(io_err) => Self::Transport(io_err),
            other => Self::Protocol(other),
        }
    }
}
