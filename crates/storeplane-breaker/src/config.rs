use std::time::Duration;

/// Per-dependency breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Budget for a single admitted call.
    pub call_timeout: Duration,
    /// Error rate (percent of window samples) that trips the breaker.
    pub error_threshold_pct: f64,
    /// How long samples stay in the rolling window.
    pub window: Duration,
    /// How long an open breaker waits before admitting a trial call.
    pub reset_timeout: Duration,
    /// Minimum samples in the window before the rate is considered.
    pub volume_threshold: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(15),
            error_threshold_pct: 50.0,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            volume_threshold: 10,
        }
    }
}

impl BreakerConfig {
    /// Profile for a security-critical dependency: trips earlier and
    /// stays open longer.
    pub fn strict() -> Self {
        Self {
            call_timeout: Duration::from_secs(20),
            error_threshold_pct: 30.0,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(120),
            volume_threshold: 3,
        }
    }
}
