//! Delays and limits used by the hardware bring-up sequence.

/// Default upper bound on register frames per bulk transaction.
pub const DEFAULT_MAX_BATCH: usize = 299;

/// Named, overridable timing constants.
///
/// Defaults match what the sensor module needs on real hardware; tests
/// shrink them or inject a recording delay instead of sleeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Settle times in ms: after power up, after pin release, before streaming.
    pub power_up_delays_ms: [u32; 3],
    /// Settle time after the common init callback.
    pub init_settle_ms: u32,
    /// Total attempts for a single register write.
    pub write_attempts: u32,
    /// Backoff between single-write attempts.
    pub retry_backoff_ms: u32,
    /// Wait between the address phase and the data phase of a read.
    pub read_settle_ms: u32,
    /// Maximum register frames in one bulk transaction.
    pub max_batch: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            power_up_delays_ms: [5, 5, 20],
            init_settle_ms: 1,
            write_attempts: 5,
            retry_backoff_ms: 20,
            read_settle_ms: 3,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

impl TimingConfig {
    /// Override the three power-up settle delays.
    #[must_use]
    pub const fn with_power_up_delays(mut self, delays_ms: [u32; 3]) -> Self {
        self.power_up_delays_ms = delays_ms;
        self
    }

    /// Override the single-write retry policy.
    #[must_use]
    pub const fn with_retry(mut self, attempts: u32, backoff_ms: u32) -> Self {
        self.write_attempts = attempts;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Override the bulk transaction size. Clamped to at least one frame.
    #[must_use]
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}
