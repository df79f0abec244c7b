//! Replica configuration.

use crate::delayer::{Delayer, ExpBackoff};
use crate::error::{ReplicationError, ReplicationResult};
use chainkv_repl_protocol::ReplicaCredentials;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default upper bound on the bytes of one fetched chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of transactions buffered ahead of the applier.
pub const DEFAULT_PREFETCH_TX_BUFFER_SIZE: usize = 100;

/// Default number of transactions prepared concurrently.
pub const DEFAULT_REPLICATION_COMMIT_CONCURRENCY: usize = 10;

/// Default long-poll wait sent with each fetch.
pub const DEFAULT_FETCH_WAIT: Duration = Duration::from_secs(1);

/// How a replica reaches and follows its primary.
#[derive(Clone)]
pub struct ReplicationOptions {
    /// Database name on the primary.
    pub primary_database: String,
    /// Primary host name or address.
    pub primary_host: String,
    /// Primary port.
    pub primary_port: u16,
    /// Replication user.
    pub primary_username: String,
    /// Replication password.
    pub primary_password: String,
    /// Upper bound on the bytes of one fetched chunk.
    pub stream_chunk_size: usize,
    /// Transactions buffered between the fetcher and the applier.
    pub prefetch_tx_buffer_size: usize,
    /// Transactions decoded and verified concurrently.
    pub replication_commit_concurrency: usize,
    /// Drop already-applied ids whose history differs from the primary's
    /// instead of failing.
    pub allow_tx_discarding: bool,
    /// Reconnect backoff.
    pub delayer: Option<Arc<dyn Delayer>>,
    /// Long-poll wait sent with each fetch.
    pub fetch_wait: Duration,
    /// Identifies this replica to the primary.
    pub replica_id: Uuid,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            primary_database: String::new(),
            primary_host: String::new(),
            primary_port: 0,
            primary_username: String::new(),
            primary_password: String::new(),
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
            prefetch_tx_buffer_size: DEFAULT_PREFETCH_TX_BUFFER_SIZE,
            replication_commit_concurrency: DEFAULT_REPLICATION_COMMIT_CONCURRENCY,
            allow_tx_discarding: false,
            delayer: Some(Arc::new(ExpBackoff::default())),
            fetch_wait: DEFAULT_FETCH_WAIT,
            replica_id: Uuid::new_v4(),
        }
    }
}

impl ReplicationOptions {
    /// Options with every numeric field zeroed and no delayer. Not valid
    /// until filled in.
    #[must_use]
    pub fn unset() -> Self {
        Self {
            stream_chunk_size: 0,
            prefetch_tx_buffer_size: 0,
            replication_commit_concurrency: 0,
            delayer: None,
            fetch_wait: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Sets the database to follow.
    #[must_use]
    pub fn with_primary_database(mut self, database: impl Into<String>) -> Self {
        self.primary_database = database.into();
        self
    }

    /// Sets the primary host.
    #[must_use]
    pub fn with_primary_host(mut self, host: impl Into<String>) -> Self {
        self.primary_host = host.into();
        self
    }

    /// Sets the primary port.
    #[must_use]
    pub fn with_primary_port(mut self, port: u16) -> Self {
        self.primary_port = port;
        self
    }

    /// Sets the replication user.
    #[must_use]
    pub fn with_primary_username(mut self, username: impl Into<String>) -> Self {
        self.primary_username = username.into();
        self
    }

    /// Sets the replication password.
    #[must_use]
    pub fn with_primary_password(mut self, password: impl Into<String>) -> Self {
        self.primary_password = password.into();
        self
    }

    /// Sets the chunk size bound.
    #[must_use]
    pub fn with_stream_chunk_size(mut self, bytes: usize) -> Self {
        self.stream_chunk_size = bytes;
        self
    }

    /// Sets the prefetch buffer size.
    #[must_use]
    pub fn with_prefetch_tx_buffer_size(mut self, txs: usize) -> Self {
        self.prefetch_tx_buffer_size = txs;
        self
    }

    /// Sets how many transactions are prepared concurrently.
    #[must_use]
    pub fn with_replication_commit_concurrency(mut self, concurrency: usize) -> Self {
        self.replication_commit_concurrency = concurrency;
        self
    }

    /// Allows discarding divergent local transactions.
    #[must_use]
    pub fn with_allow_tx_discarding(mut self, allow: bool) -> Self {
        self.allow_tx_discarding = allow;
        self
    }

    /// Sets the reconnect backoff.
    #[must_use]
    pub fn with_delayer(mut self, delayer: Arc<dyn Delayer>) -> Self {
        self.delayer = Some(delayer);
        self
    }

    /// Sets the long-poll wait.
    #[must_use]
    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    /// Sets the replica id.
    #[must_use]
    pub fn with_replica_id(mut self, replica_id: Uuid) -> Self {
        self.replica_id = replica_id;
        self
    }

    /// Whether the options can drive a replica.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.stream_chunk_size > 0
            && u32::try_from(self.stream_chunk_size).is_ok()
            && self.prefetch_tx_buffer_size > 0
            && self.replication_commit_concurrency > 0
            && self.delayer.is_some()
    }

    /// Like [`valid`](Self::valid), naming the offending field.
    ///
    /// # Errors
    ///
    /// [`ReplicationError::InvalidOptions`].
    pub fn validate(&self) -> ReplicationResult<()> {
        let problem = if self.stream_chunk_size == 0 {
            "stream chunk size must be positive"
        } else if u32::try_from(self.stream_chunk_size).is_err() {
            "stream chunk size must fit in 32 bits"
        } else if self.prefetch_tx_buffer_size == 0 {
            "prefetch buffer size must be positive"
        } else if self.replication_commit_concurrency == 0 {
            "commit concurrency must be positive"
        } else if self.delayer.is_none() {
            "a delayer is required"
        } else {
            return Ok(());
        };
        Err(ReplicationError::invalid_options(problem))
    }

    /// Credentials presented in the handshake.
    #[must_use]
    pub fn credentials(&self) -> ReplicaCredentials {
        ReplicaCredentials::new(
            self.primary_username.clone(),
            self.primary_password.clone(),
            self.primary_database.clone(),
        )
    }
}

impl fmt::Debug for ReplicationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationOptions")
            .field("primary_database", &self.primary_database)
            .field("primary_host", &self.primary_host)
            .field("primary_port", &self.primary_port)
            .field("primary_username", &self.primary_username)
            .field("primary_password", &"<redacted>")
            .field("stream_chunk_size", &self.stream_chunk_size)
            .field("prefetch_tx_buffer_size", &self.prefetch_tx_buffer_size)
            .field(
                "replication_commit_concurrency",
                &self.replication_commit_concurrency,
            )
            .field("allow_tx_discarding", &self.allow_tx_discarding)
            .field("delayer", &self.delayer)
            .field("fetch_wait", &self.fetch_wait)
            .field("replica_id", &self.replica_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_options_are_invalid() {
        let options = ReplicationOptions::unset();
        assert!(!options.valid());
        assert!(matches!(
            options.validate(),
            Err(ReplicationError::InvalidOptions(_))
        ));
    }

    #[test]
    fn setters_are_reflected_and_valid() {
        let delayer: Arc<dyn Delayer> = Arc::new(ExpBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(2 * 60),
            2.0,
            0.1,
        ));

        let options = ReplicationOptions::unset()
            .with_primary_database("defaultdb")
            .with_primary_host("127.0.0.1")
            .with_primary_port(3322)
            .with_primary_username("immudbUsr")
            .with_primary_password("immdubPwd")
            .with_stream_chunk_size(DEFAULT_CHUNK_SIZE)
            .with_prefetch_tx_buffer_size(DEFAULT_PREFETCH_TX_BUFFER_SIZE)
            .with_replication_commit_concurrency(DEFAULT_REPLICATION_COMMIT_CONCURRENCY)
            .with_allow_tx_discarding(true)
            .with_delayer(Arc::clone(&delayer));

        assert_eq!(options.primary_database, "defaultdb");
        assert_eq!(options.primary_host, "127.0.0.1");
        assert_eq!(options.primary_port, 3322);
        assert_eq!(options.primary_username, "immudbUsr");
        assert_eq!(options.primary_password, "immdubPwd");
        assert_eq!(options.stream_chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(options.prefetch_tx_buffer_size, DEFAULT_PREFETCH_TX_BUFFER_SIZE);
        assert_eq!(
            options.replication_commit_concurrency,
            DEFAULT_REPLICATION_COMMIT_CONCURRENCY
        );
        assert!(options.allow_tx_discarding);
        assert!(Arc::ptr_eq(options.delayer.as_ref().unwrap(), &delayer));
        assert!(options.valid());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn defaults_are_valid() {
        let options = ReplicationOptions::default();
        assert!(options.valid());
        assert_eq!(options.stream_chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!options.allow_tx_discarding);
    }

    #[test]
    fn each_zeroed_field_is_named() {
        let cases = [
            ReplicationOptions::default().with_stream_chunk_size(0),
            ReplicationOptions::default().with_prefetch_tx_buffer_size(0),
            ReplicationOptions::default().with_replication_commit_concurrency(0),
            ReplicationOptions {
                delayer: None,
                ..ReplicationOptions::default()
            },
        ];
        for options in cases {
            assert!(!options.valid());
            assert!(options.validate().is_err());
        }
    }

    #[test]
    fn debug_hides_the_password() {
        let options = ReplicationOptions::default().with_primary_password("hunter2");
        assert!(!format!("{options:?}").contains("hunter2"));
    }
}
