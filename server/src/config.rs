use protocol::WriterConfig;
use query::QueryConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Live queries per connection. Each one may park a page fetch, so the
    /// page worker pool gets one worker per query.
    pub max_active_queries: usize,
    pub maintenance_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    /// How long running page fetches may take to finish when a connection closes.
    pub shutdown_grace_ms: u64,
    /// Accept gzip batching when the peer offers it.
    pub gzip: bool,
    pub query: QueryConfig,
    pub writer: WriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_active_queries: 25,
            maintenance_interval_ms: 200,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 1_000,
            gzip: true,
            query: QueryConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
