//! Replication protocol messages.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Credentials a replica presents to its primary.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCredentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Name of the database to follow.
    pub database: String,
}

impl ReplicaCredentials {
    /// Creates a credential set.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            database: database.into(),
        }
    }
}

impl fmt::Debug for ReplicaCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Opens a replication session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Identifies the replica across reconnects.
    pub replica_id: Uuid,
    /// Credentials.
    pub credentials: ReplicaCredentials,
    /// Last transaction the replica has applied (0 for none).
    pub last_applied_tx_id: u64,
    /// Protocol version of the replica.
    pub protocol_version: u16,
}

impl HandshakeRequest {
    /// Creates a handshake for the current protocol version.
    pub fn new(replica_id: Uuid, credentials: ReplicaCredentials, last_applied_tx_id: u64) -> Self {
        Self {
            replica_id,
            credentials,
            last_applied_tx_id,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Whether the session was opened.
    pub accepted: bool,
    /// Token to present on every fetch.
    pub session_token: Vec<u8>,
    /// Last transaction committed on the primary.
    pub primary_last_tx_id: u64,
    /// Reason for rejection.
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// An accepted handshake.
    pub fn accepted(session_token: Vec<u8>, primary_last_tx_id: u64) -> Self {
        Self {
            accepted: true,
            session_token,
            primary_last_tx_id,
            error: None,
        }
    }

    /// A rejected handshake.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            session_token: Vec::new(),
            primary_last_tx_id: 0,
            error: Some(message.into()),
        }
    }
}

/// Requests the chunk starting at `from_tx_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Session token from the handshake.
    pub session_token: Vec<u8>,
    /// First transaction wanted.
    pub from_tx_id: u64,
    /// Upper bound on the encoded size of the chunk.
    pub max_bytes: u32,
    /// Wait up to this many milliseconds for new commits when caught up.
    pub wait_ms: u32,
}

/// A batch of consecutive transactions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Chunk {
    /// Id of the first transaction in `txs`.
    pub first_tx_id: u64,
    /// Encoded transactions in ascending id order.
    pub txs: Vec<Vec<u8>>,
    /// Last transaction committed on the primary when the chunk was cut.
    pub primary_last_tx_id: u64,
}

impl Chunk {
    /// Whether the chunk carries no transactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Id following the last transaction in this chunk.
    #[must_use]
    pub fn next_tx_id(&self) -> u64 {
        self.first_tx_id + self.txs.len() as u64
    }

    /// Total payload bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.txs.iter().map(Vec::len).sum()
    }
}

/// Error categories a primary reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The session token is unknown or forged.
    InvalidSession,
    /// The fetch asked for an offset the session has already passed.
    InvalidPreviousOffset,
    /// The request is malformed.
    BadRequest,
    /// The primary cannot serve right now.
    Unavailable,
}

/// An error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorMessage {
    /// Creates an error reply.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Every message on a replication connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Replica to primary: open a session.
    Handshake(HandshakeRequest),
    /// Primary to replica: handshake result.
    HandshakeAck(HandshakeResponse),
    /// Replica to primary: request a chunk.
    Fetch(FetchRequest),
    /// Primary to replica: a chunk.
    Chunk(Chunk),
    /// Primary to replica: the request failed.
    Error(ErrorMessage),
}

impl ReplicationMessage {
    /// Short name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "Handshake",
            Self::HandshakeAck(_) => "HandshakeAck",
            Self::Fetch(_) => "Fetch",
            Self::Chunk(_) => "Chunk",
            Self::Error(_) => "Error",
        }
    }
}

/// Encodes a message as CBOR.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode_message(message: &ReplicationMessage) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR message.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] for malformed input.
pub fn decode_message(bytes: &[u8]) -> ProtocolResult<ReplicationMessage> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}
