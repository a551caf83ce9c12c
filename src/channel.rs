//! The single-request message channel.
//!
//! One channel serves one connection serially: at most one request in
//! flight, responses matched positionally. The transport's read half runs in
//! its own task and delivers inbound messages into a one-slot handoff that
//! [`MsgChannel::await_response`] polls with a timeout; while a response is
//! parked in the slot the reader task stays free to service the socket.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{
    errors::ClientError,
    protocol::{Msg, MsgCodec, errors::ProtocolError},
};

/// Default timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type Inbound = Result<Msg, ProtocolError>;

/// Sends one request at a time and awaits its response.
pub struct MsgChannel {
    sink: Box<dyn Sink<Msg, Error = ProtocolError> + Send + Unpin>,
    inbox: mpsc::Receiver<Inbound>,
    reader: JoinHandle<()>,
    timeout: Duration,
    closed: bool,
}

impl MsgChannel {
    /// Wrap a bidirectional transport in a channel.
    ///
    /// The read half is moved into a reader task immediately; inbound
    /// messages queue into the one-slot handoff until awaited.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new<T>(io: T, timeout_dur: Duration) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(io, MsgCodec::new());
        let (write_half, stream) = framed.split();
        let sink: Box<dyn Sink<Msg, Error = ProtocolError> + Send + Unpin> = Box::new(write_half);
        let (tx, inbox) = mpsc::channel::<Inbound>(1);
        let reader = tokio::spawn(deliver_inbound(stream, tx));
        Self {
            sink,
            inbox,
            reader,
            timeout: timeout_dur,
            closed: false,
        }
    }

    /// Flush one request to the transport.
    ///
    /// Must not be called while a response is outstanding. Any unread
    /// leftover responses from a prior erroneous sequence are discarded
    /// before the request is written.
    ///
    /// # Errors
    /// Returns [`ClientError::Transport`] if the write fails,
    /// [`ClientError::Timeout`] if the flush does not complete in time, and
    /// [`ClientError::IllegalState`] after [`MsgChannel::close`].
    pub async fn send_request(&mut self, request: Msg) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::IllegalState("the channel has been closed"));
        }
        while let Ok(stale) = self.inbox.try_recv() {
            match stale {
                Ok(msg) => warn!(op = ?msg.op(), "discarding stale response"),
                Err(err) => warn!(error = %err, "discarding stale transport failure"),
            }
        }
        debug!(op = ?request.op(), len = request.payload.len(), "sending request");
        match timeout(self.timeout, self.sink.send(request)).await {
            Err(_) => Err(ClientError::Timeout(self.timeout)),
            Ok(Err(err)) => Err(ClientError::from_wire(err)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Await the next response with the configured timeout.
    ///
    /// Safe to call repeatedly to drain a multi-chunk stream.
    ///
    /// # Errors
    /// See [`MsgChannel::await_response_within`].
    pub async fn await_response(&mut self) -> Result<Msg, ClientError> {
        self.await_response_within(self.timeout).await
    }

    /// Await the next response, giving up after `limit`.
    ///
    /// # Errors
    /// Returns [`ClientError::Timeout`] when `limit` elapses,
    /// [`ClientError::Transport`] when the connection drops,
    /// [`ClientError::Server`] when the response is flagged unsuccessful,
    /// and [`ClientError::IllegalState`] after [`MsgChannel::close`].
    pub async fn await_response_within(&mut self, limit: Duration) -> Result<Msg, ClientError> {
        if self.closed {
            return Err(ClientError::IllegalState("the channel has been closed"));
        }
        match timeout(limit, self.inbox.recv()).await {
            Err(_) => Err(ClientError::Timeout(limit)),
            Ok(None) => Err(ClientError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by the server",
            ))),
            Ok(Some(Err(err))) => Err(ClientError::from_wire(err)),
            Ok(Some(Ok(response))) => {
                debug!(op = ?response.op(), len = response.payload.len(), "received response");
                if response.is_success() {
                    Ok(response)
                } else {
                    let descriptor = response.error_payload()?;
                    Err(ClientError::Server {
                        code: descriptor.code,
                        message: descriptor.message,
                    })
                }
            }
        }
    }

    /// Release the transport. Idempotent; never raises.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reader.abort();
        if let Err(err) = self.sink.close().await {
            debug!(error = %err, "transport shutdown failure ignored on close");
        }
        debug!("channel closed");
    }
}

impl Drop for MsgChannel {
    fn drop(&mut self) { self.reader.abort() }
}

/// Reader-task body: pump decoded frames into the one-slot handoff until the
/// stream or the receiver goes away.
async fn deliver_inbound<S>(mut stream: S, tx: mpsc::Sender<Inbound>)
where
    S: Stream<Item = Inbound> + Unpin,
{
    while let Some(item) = stream.next().await {
        let failed = item.is_err();
        if tx.send(item).await.is_err() {
            break;
        }
        if failed {
            break;
        }
    }
}
