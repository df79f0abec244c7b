//! # chainkv replication protocol
//!
//! Messages exchanged between a primary and its replicas, their CBOR
//! encoding and length-delimited framing over any async byte stream.
//!
//! A session is a handshake followed by any number of fetches:
//!
//! ```text
//! replica                           primary
//!   | -- Handshake(last_applied) -->  |
//!   | <-- HandshakeAck(token) ------  |
//!   | -- Fetch(from_tx_id) -------->  |
//!   | <-- Chunk(txs) ---------------  |
//!   | ...                             |
//! ```
//!
//! Transactions travel inside a [`Chunk`] in the binary payload format of
//! `chainkv_core::codec`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod framing;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{MessageSink, MessageStream, MAX_FRAME_SIZE};
pub use messages::{
    decode_message, encode_message, Chunk, ErrorCode, ErrorMessage, FetchRequest,
    HandshakeRequest, HandshakeResponse, ReplicaCredentials, ReplicationMessage,
    PROTOCOL_VERSION,
};
