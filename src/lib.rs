//! Asynchronous client for the Tidemark time-series database.
//!
//! The client opens one connection per [`Client`], sends structured requests
//! over a single-request channel, and consumes either a single control
//! response or a streamed result set of typed, length-prefixed records.
//! Reads materialize delta-encoded records onto a retained current record
//! per type; writes group caller-built records into per-partition batches
//! that can be partially replayed after a failure.

pub mod batch;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod protocol;
pub mod record;
pub mod recordset;
pub mod schema;
pub mod stream;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use client::{Client, Database, TimeSeries};
pub use config::ClientConfig;
pub use errors::ClientError;
pub use recordset::RecordSet;
pub use schema::SeriesDefinition;
