//! Connections to a primary.
//!
//! A [`PrimaryConnector`] opens [`PrimarySession`]s; the replicator only
//! talks to those two traits. [`TcpConnector`] is the production transport,
//! [`LoopbackConnector`] serves an in-process primary over a pipe and can
//! inject connection failures.

use crate::error::{ReplicationError, ReplicationResult};
use crate::options::ReplicationOptions;
use chainkv_primary::{serve_connection, RequestHandler};
use chainkv_repl_protocol::{
    Chunk, FetchRequest, HandshakeRequest, HandshakeResponse, MessageSink, MessageStream,
    ProtocolError, ReplicationMessage,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;

/// An open connection to a primary.
pub trait PrimarySession: Send {
    /// Opens a replication session.
    fn handshake(
        &mut self,
        request: HandshakeRequest,
    ) -> impl Future<Output = ReplicationResult<HandshakeResponse>> + Send;

    /// Fetches the next chunk.
    fn fetch(&mut self, request: FetchRequest)
        -> impl Future<Output = ReplicationResult<Chunk>> + Send;
}

/// Opens connections to a primary.
pub trait PrimaryConnector: Send + Sync {
    /// Session type produced by this connector.
    type Session: PrimarySession + 'static;

    /// Connects to the primary described by `options`.
    fn connect(
        &self,
        options: &ReplicationOptions,
    ) -> impl Future<Output = ReplicationResult<Self::Session>> + Send;
}

/// Request/reply session over any framed byte stream.
pub struct FramedSession<R, W> {
    requests: MessageSink<W>,
    replies: MessageStream<R>,
}

impl<R, W> std::fmt::Debug for FramedSession<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedSession").finish_non_exhaustive()
    }
}

impl<R, W> FramedSession<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps the two halves of a connection.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            requests: MessageSink::new(writer),
            replies: MessageStream::new(reader),
        }
    }

    async fn call(&mut self, message: ReplicationMessage) -> ReplicationResult<ReplicationMessage> {
        self.requests.send(&message).await?;
        match self.replies.expect().await? {
            ReplicationMessage::Error(err) => Err(ReplicationError::Remote {
                code: err.code,
                message: err.message,
            }),
            reply => Ok(reply),
        }
    }
}

impl<R, W> PrimarySession for FramedSession<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn handshake(
        &mut self,
        request: HandshakeRequest,
    ) -> ReplicationResult<HandshakeResponse> {
        match self.call(ReplicationMessage::Handshake(request)).await? {
            ReplicationMessage::HandshakeAck(response) => Ok(response),
            other => Err(unexpected("HandshakeAck", &other)),
        }
    }

    async fn fetch(&mut self, request: FetchRequest) -> ReplicationResult<Chunk> {
        match self.call(ReplicationMessage::Fetch(request)).await? {
            ReplicationMessage::Chunk(chunk) => Ok(chunk),
            other => Err(unexpected("Chunk", &other)),
        }
    }
}

fn unexpected(expected: &'static str, actual: &ReplicationMessage) -> ReplicationError {
    ProtocolError::UnexpectedMessage {
        expected,
        actual: actual.name(),
    }
    .into()
}

/// Connects over TCP to `primary_host:primary_port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConnector {
    /// Creates a connector with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl PrimaryConnector for TcpConnector {
    type Session = FramedSession<OwnedReadHalf, OwnedWriteHalf>;

    async fn connect(&self, options: &ReplicationOptions) -> ReplicationResult<Self::Session> {
        let host = options.primary_host.as_str();
        let port = options.primary_port;
        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ReplicationError::connection(format!("{host}:{port}: timed out")))?
            .map_err(|e| ReplicationError::connection(format!("{host}:{port}: {e}")))?;
        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!(error = %err, "could not disable Nagle");
        }
        let (reader, writer) = socket.into_split();
        Ok(FramedSession::new(reader, writer))
    }
}

const LOOPBACK_BUFFER: usize = 256 * 1024;

/// Serves an in-process primary over `tokio::io::duplex` pipes.
pub struct LoopbackConnector {
    handler: RequestHandler,
    refusals: AtomicU32,
    connections: Mutex<Vec<AbortHandle>>,
}

impl LoopbackConnector {
    /// Creates a connector serving `handler`.
    pub fn new(handler: RequestHandler) -> Self {
        Self {
            handler,
            refusals: AtomicU32::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Refuses the next `attempts` connection attempts.
    pub fn refuse_next(&self, attempts: u32) {
        self.refusals.store(attempts, Ordering::SeqCst);
    }

    /// Number of connections still being served.
    pub fn open_connections(&self) -> usize {
        let mut connections = self.connections.lock();
        connections.retain(|c| !c.is_finished());
        connections.len()
    }

    /// Drops the primary side of every open connection. Returns how many
    /// were open.
    pub fn sever_all(&self) -> usize {
        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in &connections {
            connection.abort();
        }
        connections.len()
    }
}

impl PrimaryConnector for LoopbackConnector {
    type Session = FramedSession<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    async fn connect(&self, _options: &ReplicationOptions) -> ReplicationResult<Self::Session> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ReplicationError::connection("loopback connection refused"));
        }

        let (client, server) = tokio::io::duplex(LOOPBACK_BUFFER);
        let handler = self.handler.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = serve_connection(handler, server).await {
                tracing::debug!(error = %err, "loopback connection ended");
            }
        });
        let mut connections = self.connections.lock();
        connections.retain(|c| !c.is_finished());
        connections.push(task.abort_handle());
        drop(connections);

        let (reader, writer) = tokio::io::split(client);
        Ok(FramedSession::new(reader, writer))
    }
}

impl std::fmt::Debug for LoopbackConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConnector")
            .field("refusals", &self.refusals.load(Ordering::SeqCst))
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}
