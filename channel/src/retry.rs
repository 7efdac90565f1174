use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialFactorBackoff};

use crate::config::RetryConfig;

/// How often a failed call is re-sent. Calls whose side effects must not be
/// duplicated, like keep-alives with gossip, use `NoRetry`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    Default,
    NoRetry,
}

impl RetryPolicy {
    pub(crate) fn strategy(&self, config: &RetryConfig) -> Vec<Duration> {
        match self {
            RetryPolicy::NoRetry => Vec::new(),
            RetryPolicy::Default => ExponentialFactorBackoff::from_millis(
                config.initial_backoff_ms,
                config.backoff_factor,
            )
            .map(jitter)
            .take(config.attempts)
            .collect(),
        }
    }
}
