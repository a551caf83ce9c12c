//! Client entry point and the database/series handles.
//!
//! A [`Client`] owns one connection behind an async mutex. Handles clone the
//! connection handle; the lock enforces the single-writer/single-reader
//! discipline, and a streamed result set holds the lock until it is dropped
//! so no other request can interleave with an undrained stream.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    batch::{PartitionedRecordSet, RecordSetBuilder, encode_bulk_write},
    config::ClientConfig,
    connection::Connection,
    errors::ClientError,
    protocol::{Msg, OpCode, errors::ProtocolError, wire},
    recordset::RecordSet,
    schema::SeriesDefinition,
    stream::{ConnectionChunks, RecordStream},
};

type SharedConnection = Arc<Mutex<Connection>>;

/// Entry point for talking to a Tidemark server.
pub struct Client {
    conn: SharedConnection,
}

impl Client {
    /// Connect to the server named by `config`.
    ///
    /// # Errors
    /// Propagates connection failures.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self::from_connection(Connection::connect(config).await?))
    }

    /// Wrap an already-opened connection.
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Execute one query and expose its result as a record set.
    ///
    /// A query returning no records yields an empty set. A streamed result
    /// holds the connection lock until the returned set is dropped, so drop
    /// it before issuing the next request.
    ///
    /// # Errors
    /// Propagates channel, server, and protocol failures.
    pub async fn execute(&self, text: &str) -> Result<RecordSet, ClientError> {
        execute_on(&self.conn, text).await
    }

    /// Select `name` as the session database and return a handle to it.
    ///
    /// # Errors
    /// Propagates channel, server, and protocol failures.
    pub async fn database(&self, name: &str) -> Result<Database, ClientError> {
        let mut set = self.execute(&format!("USE {name};")).await?;
        set.close();
        Ok(Database {
            name: name.to_owned(),
            conn: self.conn.clone(),
        })
    }

    /// Create a database and return a handle to it.
    ///
    /// # Errors
    /// Propagates channel, server, and protocol failures.
    pub async fn create_database(&self, name: &str) -> Result<Database, ClientError> {
        let mut set = self.execute(&format!("CREATE DATABASE {name};")).await?;
        set.close();
        self.database(name).await
    }

    /// Close the underlying connection. Idempotent; never raises.
    pub async fn close(&self) {
        let mut conn = self.conn.lock().await;
        conn.close().await;
    }
}

/// Dispatch one query on a shared connection and convert its response.
async fn execute_on(conn: &SharedConnection, text: &str) -> Result<RecordSet, ClientError> {
    let mut guard = Arc::clone(conn).lock_owned().await;
    let database = guard.database().unwrap_or_default().to_owned();
    guard.send_request(Msg::query(&database, text)).await?;
    let response = guard.await_response().await?;
    convert_response(guard, &response)
}

/// Turn the first response of a query into the matching record set shape.
fn convert_response(
    mut guard: OwnedMutexGuard<Connection>,
    response: &Msg,
) -> Result<RecordSet, ClientError> {
    match response.op() {
        OpCode::DataHeader => {
            let mut view = response.payload.clone();
            let definition = Arc::new(SeriesDefinition::decode(&mut view)?);
            let stream = RecordStream::new(definition.clone(), ConnectionChunks::new(guard));
            Ok(RecordSet::new(definition, Box::new(stream)))
        }
        OpCode::UseDatabase => {
            guard.set_database(response.database_payload()?);
            Ok(RecordSet::empty())
        }
        _ => Ok(RecordSet::empty()),
    }
}

/// Handle to one database on the server.
pub struct Database {
    name: String,
    conn: SharedConnection,
}

impl Database {
    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Create a series from an inline definition and return its handle.
    ///
    /// # Errors
    /// Propagates channel, server, and protocol failures; an unexpected
    /// response opcode is a protocol violation.
    pub async fn create_series(
        &self,
        definition: SeriesDefinition,
    ) -> Result<TimeSeries, ClientError> {
        let mut payload = BytesMut::new();
        wire::write_str(&mut payload, &self.name);
        definition.encode(&mut payload);
        let request = Msg::request(OpCode::CreateSeries, payload.freeze());

        let mut guard = self.conn.lock().await;
        let response = guard.request(request).await?;
        drop(guard);
        if response.op() != OpCode::Ack {
            return Err(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                response.op(),
            )));
        }
        Ok(TimeSeries {
            database: self.name.clone(),
            definition: Arc::new(definition),
            conn: self.conn.clone(),
        })
    }

    /// Fetch a series definition by name and return its handle.
    ///
    /// # Errors
    /// Propagates channel, server, and protocol failures; an unexpected
    /// response opcode is a protocol violation.
    pub async fn series(&self, name: &str) -> Result<TimeSeries, ClientError> {
        let mut payload = BytesMut::new();
        wire::write_str(&mut payload, &self.name);
        wire::write_str(&mut payload, name);
        let request = Msg::request(OpCode::GetSeries, payload.freeze());

        let mut guard = self.conn.lock().await;
        let response = guard.request(request).await?;
        drop(guard);
        if response.op() != OpCode::DataHeader {
            return Err(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                response.op(),
            )));
        }
        let mut view = response.payload.clone();
        let definition = Arc::new(SeriesDefinition::decode(&mut view)?);
        Ok(TimeSeries {
            database: self.name.clone(),
            definition,
            conn: self.conn.clone(),
        })
    }
}

/// Handle to one time series.
pub struct TimeSeries {
    database: String,
    definition: Arc<SeriesDefinition>,
    conn: SharedConnection,
}

impl TimeSeries {
    /// Series name.
    #[must_use]
    pub fn name(&self) -> &str { self.definition.name() }

    /// The series definition.
    #[must_use]
    pub fn definition(&self) -> &SeriesDefinition { &self.definition }

    /// Start building records for a bulk write against this series.
    #[must_use]
    pub fn record_set_builder(&self) -> RecordSetBuilder {
        RecordSetBuilder::new(self.definition.clone())
    }

    /// Write the not-yet-consumed remainder of a built record set.
    ///
    /// One write-batch request is sent per partition, in first-seen
    /// partition order. Batches are independent: a failure leaves the
    /// already-acknowledged partitions written, and the caller can advance
    /// the set's cursor past them and retry with only the remainder.
    ///
    /// # Errors
    /// Propagates channel, server, and protocol failures of the failing
    /// batch.
    pub async fn write(&self, records: &PartitionedRecordSet) -> Result<(), ClientError> {
        let batches = records.remainder();
        let mut guard = self.conn.lock().await;
        for (range, partition_records) in batches {
            let request = encode_bulk_write(
                &self.database,
                self.definition.name(),
                range,
                &partition_records,
                &self.definition,
            )?;
            let response = guard.request(request).await?;
            if response.op() != OpCode::Ack {
                return Err(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                    response.op(),
                )));
            }
        }
        Ok(())
    }

    /// Read the records of this series whose primary timestamp falls in
    /// `[start_ms, end_ms)`.
    ///
    /// # Errors
    /// Propagates channel, server, and protocol failures.
    pub async fn read(&self, start_ms: i64, end_ms: i64) -> Result<RecordSet, ClientError> {
        let text = format!(
            "SELECT * FROM {} WHERE timestamp >= {start_ms} AND timestamp < {end_ms};",
            self.definition.name()
        );
        execute_on(&self.conn, &text).await
    }
}
