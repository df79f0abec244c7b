//! # chainkv primary
//!
//! The primary side of replication:
//! - [`TxExporter`] / [`TxStream`]: lazy, forward-only streams of committed
//!   transactions that follow the store's commits without blocking them
//! - [`RequestHandler`]: handshake (credentials, database, protocol version)
//!   and per-session fetches
//! - [`PrimaryServer`]: serves replicas over TCP
//!
//! ```rust,no_run
//! use chainkv_core::{ImmuStore, StoreConfig};
//! use chainkv_primary::{PrimaryConfig, PrimaryServer};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(ImmuStore::open("data/primary", StoreConfig::default())?);
//! let config = PrimaryConfig::new("replicator", "secret", "ledger", b"token-key".to_vec());
//! let server = PrimaryServer::new(config, store)?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3322").await?;
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod error;
mod exporter;
mod handler;
mod server;

pub use auth::TokenIssuer;
pub use config::{ExporterConfig, PrimaryConfig};
pub use error::{PrimaryError, PrimaryResult};
pub use exporter::{TxExporter, TxStream};
pub use handler::{HandlerContext, RequestHandler};
pub use server::{serve_connection, PrimaryServer};
