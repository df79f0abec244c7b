//! Primary configuration.

use std::time::Duration;

/// How transaction streams cut chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterConfig {
    /// Upper bound on the encoded size of a chunk. A chunk always carries at
    /// least one transaction, even one larger than this.
    pub max_chunk_bytes: usize,
    /// Longest a fetch waits for new commits once the replica is caught up.
    pub long_poll: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 64 * 1024,
            long_poll: Duration::from_secs(5),
        }
    }
}

impl ExporterConfig {
    /// Sets the maximum chunk size.
    #[must_use]
    pub fn with_max_chunk_bytes(mut self, bytes: usize) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    /// Sets the long-poll wait.
    #[must_use]
    pub fn with_long_poll(mut self, wait: Duration) -> Self {
        self.long_poll = wait;
        self
    }
}

/// Configuration of a [`PrimaryServer`](crate::PrimaryServer).
#[derive(Clone)]
pub struct PrimaryConfig {
    /// User name replicas must present.
    pub username: String,
    /// Password replicas must present.
    pub password: String,
    /// Name under which the store is offered.
    pub database: String,
    /// Key for signing session tokens.
    pub token_secret: Vec<u8>,
    /// Lifetime of a session token.
    pub token_ttl: Duration,
    /// Chunking and long-poll settings.
    pub exporter: ExporterConfig,
}

impl PrimaryConfig {
    /// Creates a configuration with default exporter settings.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        token_secret: Vec<u8>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            database: database.into(),
            token_secret,
            token_ttl: Duration::from_secs(24 * 60 * 60),
            exporter: ExporterConfig::default(),
        }
    }

    /// Sets the exporter settings.
    #[must_use]
    pub fn with_exporter(mut self, exporter: ExporterConfig) -> Self {
        self.exporter = exporter;
        self
    }

    /// Sets the session token lifetime.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }
}

impl std::fmt::Debug for PrimaryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryConfig")
            .field("username", &self.username)
            .field("database", &self.database)
            .field("token_ttl", &self.token_ttl)
            .field("exporter", &self.exporter)
            .finish_non_exhaustive()
    }
}
