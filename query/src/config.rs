use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub result_queue_capacity: usize,
    /// A continuous page with results is closed once it has been open this long.
    pub continuous_flush_ms: u64,
    pub snapshot_page_size: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            result_queue_capacity: 1024,
            continuous_flush_ms: 1000,
            snapshot_page_size: 1000,
        }
    }
}

impl QueryConfig {
    pub fn continuous_flush(&self) -> Duration {
        Duration::from_millis(self.continuous_flush_ms)
    }
}
