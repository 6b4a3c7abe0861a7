//! Controller configuration.

/// Timing and retry limits of a [`crate::ConcurrencyController`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// A slot whose owner showed no activity for this long counts as stalled
    /// (in milliseconds).
    pub activity_timeout_ms: u64,
    /// First delay when polling a predecessor (in milliseconds).
    pub initial_backoff_ms: u64,
    /// Upper bound of the doubling poll delay (in milliseconds).
    pub max_backoff_ms: u64,
    /// Revision slots a single grab may probe before giving up.
    pub max_grab_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            activity_timeout_ms: 10_000,
            initial_backoff_ms: 5,
            max_backoff_ms: 1_000,
            max_grab_attempts: 10_000,
        }
    }
}

impl ControllerConfig {
    /// Owners refresh their own slot once it is this old, well before anyone
    /// could consider it stalled.
    pub(crate) fn heartbeat_interval_ms(&self) -> u64 {
        (self.activity_timeout_ms / 2).max(1)
    }

    /// Longest single sleep while polling. Capped at half the heartbeat
    /// interval so a waiting owner refreshes its slot before it can be
    /// taken for stalled.
    pub(crate) fn poll_cap_ms(&self) -> u64 {
        self.max_backoff_ms
            .min(self.heartbeat_interval_ms() / 2)
            .max(1)
    }
}

/// Builder for controller configuration.
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    pub fn activity_timeout(mut self, ms: u64) -> Self {
        self.config.activity_timeout_ms = ms;
        self
    }

    pub fn initial_backoff(mut self, ms: u64) -> Self {
        self.config.initial_backoff_ms = ms;
        self
    }

    pub fn max_backoff(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn max_grab_attempts(mut self, attempts: u32) -> Self {
        self.config.max_grab_attempts = attempts;
        self
    }

    pub fn build(self) -> ControllerConfig {
        self.config
    }
}

impl Default for ControllerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
