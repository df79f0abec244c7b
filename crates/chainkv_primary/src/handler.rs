//! Request handling for replica sessions.

use crate::auth::TokenIssuer;
use crate::config::PrimaryConfig;
use crate::error::{PrimaryError, PrimaryResult};
use crate::exporter::{TxExporter, TxStream};
use chainkv_core::{ImmuStore, TxId};
use chainkv_repl_protocol::{
    Chunk, ErrorCode, ErrorMessage, FetchRequest, HandshakeRequest, HandshakeResponse,
    ReplicationMessage, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// A replica's open session.
#[derive(Debug)]
struct ReplicaSession {
    replica_id: Uuid,
    stream: TxStream,
}

/// Shared state behind every connection.
pub struct HandlerContext {
    config: PrimaryConfig,
    exporter: TxExporter,
    tokens: TokenIssuer,
    sessions: RwLock<HashMap<Uuid, Arc<AsyncMutex<ReplicaSession>>>>,
}

impl HandlerContext {
    /// Creates the context for `store`.
    ///
    /// # Errors
    ///
    /// [`PrimaryError::InvalidConfig`] if the token secret is unusable.
    pub fn new(config: PrimaryConfig, store: Arc<ImmuStore>) -> PrimaryResult<Self> {
        let tokens = TokenIssuer::new(&config.token_secret, config.token_ttl)?;
        let exporter = TxExporter::new(store, config.exporter.clone());
        Ok(Self {
            config,
            exporter,
            tokens,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn session(&self, token: &[u8]) -> PrimaryResult<Arc<AsyncMutex<ReplicaSession>>> {
        let session_id = self.tokens.verify(token)?;
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(PrimaryError::UnknownSession)
    }
}

/// Answers replication requests.
#[derive(Clone)]
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a handler over `context`.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Opens a session if the replica is allowed in.
    ///
    /// Rejections are reported in the response, not as errors. On success
    /// the returned session id identifies the new session.
    pub fn handle_handshake(&self, request: HandshakeRequest) -> (HandshakeResponse, Option<Uuid>) {
        let config = &self.context.config;
        if request.protocol_version != PROTOCOL_VERSION {
            return (
                HandshakeResponse::rejected(format!(
                    "unsupported protocol version {}",
                    request.protocol_version
                )),
                None,
            );
        }
        let credentials = &request.credentials;
        if credentials.username != config.username || credentials.password != config.password {
            tracing::warn!(replica_id = %request.replica_id, "replica rejected: invalid credentials");
            return (HandshakeResponse::rejected("invalid credentials"), None);
        }
        if credentials.database != config.database {
            return (
                HandshakeResponse::rejected(format!("unknown database {}", credentials.database)),
                None,
            );
        }

        let Some(from) = TxId(request.last_applied_tx_id).checked_next() else {
            tracing::warn!(
                replica_id = %request.replica_id,
                last_applied_tx_id = request.last_applied_tx_id,
                "replica rejected: last applied id has no successor"
            );
            return (
                HandshakeResponse::rejected(format!(
                    "last applied id {} has no successor",
                    request.last_applied_tx_id
                )),
                None,
            );
        };
        let session_id = Uuid::new_v4();
        let session = ReplicaSession {
            replica_id: request.replica_id,
            stream: self.context.exporter.stream_from(from),
        };
        self.context
            .sessions
            .write()
            .insert(session_id, Arc::new(AsyncMutex::new(session)));

        let last = self.context.exporter.store().last_committed_tx_id();
        tracing::info!(
            replica_id = %request.replica_id,
            %session_id,
            from = from.as_u64(),
            primary_last_tx_id = last.as_u64(),
            "replica session opened"
        );
        (
            HandshakeResponse::accepted(self.context.tokens.issue(session_id), last.as_u64()),
            Some(session_id),
        )
    }

    /// Serves the next chunk of a session.
    ///
    /// # Errors
    ///
    /// Token and session errors, [`PrimaryError::InvalidPreviousOffset`],
    /// store read errors.
    pub async fn handle_fetch(&self, request: FetchRequest) -> PrimaryResult<Chunk> {
        let session = self.context.session(&request.session_token)?;
        let exporter = &self.context.config.exporter;
        let wait = Duration::from_millis(u64::from(request.wait_ms)).min(exporter.long_poll);

        let mut session = session.lock().await;
        let chunk = session
            .stream
            .fetch(TxId(request.from_tx_id), request.max_bytes as usize, wait)
            .await?;
        if !chunk.is_empty() {
            tracing::debug!(
                replica_id = %session.replica_id,
                first = chunk.first_tx_id,
                count = chunk.txs.len(),
                "serving chunk"
            );
        }
        Ok(chunk)
    }

    /// Dispatches one message. The second value is the session opened by
    /// a successful handshake.
    pub async fn handle_message(
        &self,
        message: ReplicationMessage,
    ) -> (ReplicationMessage, Option<Uuid>) {
        match message {
            ReplicationMessage::Handshake(request) => {
                let (response, session) = self.handle_handshake(request);
                (ReplicationMessage::HandshakeAck(response), session)
            }
            ReplicationMessage::Fetch(request) => match self.handle_fetch(request).await {
                Ok(chunk) => (ReplicationMessage::Chunk(chunk), None),
                Err(err) => (ReplicationMessage::Error(error_reply(&err)), None),
            },
            other => (
                ReplicationMessage::Error(ErrorMessage::new(
                    ErrorCode::BadRequest,
                    format!("unexpected {} from replica", other.name()),
                )),
                None,
            ),
        }
    }

    /// Drops a session, e.g. when its connection ends.
    pub fn end_session(&self, session_id: &Uuid) {
        if self.context.sessions.write().remove(session_id).is_some() {
            tracing::debug!(%session_id, "replica session closed");
        }
    }
}

fn error_reply(err: &PrimaryError) -> ErrorMessage {
    let code = match err {
        PrimaryError::InvalidPreviousOffset { .. } => ErrorCode::InvalidPreviousOffset,
        PrimaryError::NotAuthorized(_) | PrimaryError::UnknownSession => ErrorCode::InvalidSession,
        PrimaryError::InvalidConfig(_) => ErrorCode::BadRequest,
        PrimaryError::Store(_)
        | PrimaryError::Protocol(_)
        | PrimaryError::Io(_)
        | PrimaryError::TxTooLarge { .. } => ErrorCode::Unavailable,
    };
    ErrorMessage::new(code, err.to_string())
}
