use protocol::WriterConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Callers wait for a free slot once this many calls are pending.
    pub max_in_flight_calls: usize,
    pub maintenance_interval_ms: u64,
    /// Idle time after which a keep-alive is sent.
    pub keep_alive_interval_ms: u64,
    /// How long an orderly disconnect waits for pending calls.
    pub settle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Offer gzip batching to the peer.
    pub gzip: bool,
    pub writer: WriterConfig,
    pub retry: RetryConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_in_flight_calls: 1000,
            maintenance_interval_ms: 200,
            keep_alive_interval_ms: 30_000,
            settle_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            gzip: true,
            writer: WriterConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ChannelConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: usize,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 100,
            backoff_factor: 2.0,
        }
    }
}
