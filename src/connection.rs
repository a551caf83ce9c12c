//! One physical transport session.
//!
//! A connection owns its [`MsgChannel`] and the session state the server
//! tracks for it (currently just the selected database). It is not reusable
//! after close; callers open a fresh connection instead.

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::info;

use crate::{channel::MsgChannel, config::ClientConfig, errors::ClientError, protocol::Msg};

/// A live session with a Tidemark server.
pub struct Connection {
    channel: MsgChannel,
    database: Option<String>,
}

impl Connection {
    /// Open a TCP connection using the given configuration.
    ///
    /// # Errors
    /// Returns [`ClientError::Timeout`] if the connect attempt does not
    /// complete in time and [`ClientError::Transport`] for socket failures.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let addr = config.address();
        let connect_timeout = config.connect_timeout();
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Timeout(connect_timeout))?
            .map_err(ClientError::Transport)?;
        stream.set_nodelay(true).map_err(ClientError::Transport)?;
        info!(%addr, "connected");
        Ok(Self::from_io(stream, config.query_timeout()))
    }

    /// Wrap an already-established bidirectional transport.
    ///
    /// Useful for tunnelled transports and for tests running against an
    /// in-process server.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn from_io<T>(io: T, timeout: Duration) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            channel: MsgChannel::new(io, timeout),
            database: None,
        }
    }

    /// The database selected on this session, if any.
    #[must_use]
    pub fn database(&self) -> Option<&str> { self.database.as_deref() }

    pub(crate) fn set_database(&mut self, name: String) { self.database = Some(name) }

    /// Flush one request to the server.
    ///
    /// # Errors
    /// See [`MsgChannel::send_request`].
    pub async fn send_request(&mut self, request: Msg) -> Result<(), ClientError> {
        self.channel.send_request(request).await
    }

    /// Await the next response.
    ///
    /// # Errors
    /// See [`MsgChannel::await_response`].
    pub async fn await_response(&mut self) -> Result<Msg, ClientError> {
        self.channel.await_response().await
    }

    /// Send one request and await its single response.
    ///
    /// # Errors
    /// Combines the failures of [`Connection::send_request`] and
    /// [`Connection::await_response`].
    pub async fn request(&mut self, request: Msg) -> Result<Msg, ClientError> {
        self.send_request(request).await?;
        self.await_response().await
    }

    /// Close the session. Idempotent; never raises.
    pub async fn close(&mut self) { self.channel.close().await }
}
