use crate::config::ControllerConfig;
use std::time::Duration;

/// Doubling poll delay, capped at a maximum.
#[derive(Clone, Debug)]
pub struct Backoff {
    next_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            next_ms: initial_ms.min(max_ms),
            max_ms,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.initial_backoff_ms, config.poll_cap_ms())
    }

    /// The delay to sleep now; the following one is twice as long.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_ms;
        self.next_ms = self.next_ms.saturating_mul(2).min(self.max_ms);
        Duration::from_millis(delay)
    }

    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
