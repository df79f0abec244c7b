//! TCP server for replicas.

use crate::config::PrimaryConfig;
use crate::error::PrimaryResult;
use crate::handler::{HandlerContext, RequestHandler};
use chainkv_core::ImmuStore;
use chainkv_repl_protocol::{MessageSink, MessageStream, ProtocolResult};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use uuid::Uuid;

/// Serves replication sessions for one store.
pub struct PrimaryServer {
    handler: RequestHandler,
}

impl PrimaryServer {
    /// Creates a server for `store`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is unusable.
    pub fn new(config: PrimaryConfig, store: Arc<ImmuStore>) -> PrimaryResult<Self> {
        let context = Arc::new(HandlerContext::new(config, store)?);
        Ok(Self {
            handler: RequestHandler::new(context),
        })
    }

    /// The request handler, for in-process transports.
    #[must_use]
    pub fn handler(&self) -> RequestHandler {
        self.handler.clone()
    }

    /// Accepts connections until the listener fails.
    ///
    /// # Errors
    ///
    /// Accept errors.
    pub async fn serve(&self, listener: TcpListener) -> PrimaryResult<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Accept errors.
    pub async fn serve_until(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> PrimaryResult<()> {
        tokio::pin!(shutdown);
        tracing::info!(addr = ?listener.local_addr().ok(), "primary listening");
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("primary shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(handler, socket).await {
                            tracing::debug!(%peer, error = %err, "replica connection ended");
                        }
                    });
                }
            }
        }
    }
}

/// Serves one replica connection until it closes.
///
/// Works over any byte stream, so in-process transports can use it with
/// `tokio::io::duplex`. Sessions opened on the connection end with it, also
/// when the serving task is aborted.
///
/// # Errors
///
/// Wire errors.
pub async fn serve_connection<S>(handler: RequestHandler, stream: S) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut requests = MessageStream::new(reader);
    let mut replies = MessageSink::new(writer);
    let mut sessions = ConnectionSessions {
        handler,
        opened: Vec::new(),
    };

    while let Some(message) = requests.recv().await? {
        let (reply, session) = sessions.handler.handle_message(message).await;
        sessions.opened.extend(session);
        replies.send(&reply).await?;
    }
    Ok(())
}

/// Sessions opened on one connection, ended when it is dropped.
struct ConnectionSessions {
    handler: RequestHandler,
    opened: Vec<Uuid>,
}

impl Drop for ConnectionSessions {
    fn drop(&mut self) {
        for session in &self.opened {
            self.handler.end_session(session);
        }
    }
}
