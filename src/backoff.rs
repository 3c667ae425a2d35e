//! Retry backoff with jitter.
//!
//! Controls the delay between same-instance retries in the scheduler. A
//! provider-supplied `Retry-After` always overrides the computed delay;
//! jitter keeps a fleet of gateways from hammering a shared provider in
//! lockstep.

use std::time::Duration;

/// Jitter strategy applied to computed delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    None,
    /// Random value in `[0, calculated]`. The safe default.
    Full,
    /// `calculated/2 + random in [0, calculated/2]`.
    Equal,
}

/// Exponential backoff configuration.
///
/// # Example
///
/// ```
/// use model_relay::backoff::RetryBackoff;
///
/// let backoff = RetryBackoff::standard();
/// assert!(backoff.delay_for_attempt(1) <= backoff.delay_for_attempt(10));
/// ```
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl RetryBackoff {
    /// Sensible defaults: 200ms initial, 2x growth, 10s cap, full jitter.
    pub fn standard() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: JitterStrategy::Full,
        }
    }

    /// No delay at all. For tests and latency-critical embedders that
    /// prefer immediate failover behavior.
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: JitterStrategy::None,
        }
    }

    /// The delay before retry attempt N (0-indexed).
    ///
    /// Base is `initial * multiplier^attempt`, capped at `max_delay`, then
    /// jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };
        Duration::from_secs_f64(jittered)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::standard()
    }
}
