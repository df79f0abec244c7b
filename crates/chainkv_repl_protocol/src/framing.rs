//! Length-delimited framing of [`ReplicationMessage`]s over async streams.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{decode_message, encode_message, ReplicationMessage};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Writes length-prefixed messages.
pub struct MessageSink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> MessageSink<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec()),
        }
    }

    /// Sends one message and flushes it.
    ///
    /// # Errors
    ///
    /// Encoding or I/O failures.
    pub async fn send(&mut self, message: &ReplicationMessage) -> ProtocolResult<()> {
        let bytes = encode_message(message)?;
        self.inner.send(Bytes::from(bytes)).await?;
        Ok(())
    }
}

/// Reads length-prefixed messages.
pub struct MessageStream<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> MessageStream<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, codec()),
        }
    }

    /// Receives the next message, or `None` once the peer closed the stream.
    ///
    /// # Errors
    ///
    /// I/O failures, oversized frames or undecodable messages.
    pub async fn recv(&mut self) -> ProtocolResult<Option<ReplicationMessage>> {
        match self.inner.next().await {
            Some(Ok(frame)) => decode_message(&frame).map(Some),
            Some(Err(e)) => Err(ProtocolError::Io(e)),
            None => Ok(None),
        }
    }

    /// Receives the next message, treating end of stream as an error.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ConnectionClosed`] if the peer is gone.
    pub async fn expect(&mut self) -> ProtocolResult<ReplicationMessage> {
        self.recv().await?.ok_or(ProtocolError::ConnectionClosed)
    }
}
