//! Backoff policy for retry delays.
//!
//! Computes `min(max_delay, base_delay × multiplier^attempt) + uniform(0, jitter)` where
//! `attempt` is the 0-based index of the attempt that just failed. The jitter draw is
//! strictly additive, so the result is never below `base_delay`, even at attempt 0.
//! Jitter desynchronizes concurrent retriers so a shared outage does not produce a
//! synchronized retry storm.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use attendry_resilience::BackoffPolicy;
//!
//! let backoff = BackoffPolicy::new(
//!     Duration::from_millis(100),
//!     Duration::from_secs(2),
//!     2.0,
//!     Duration::ZERO,
//! )
//! .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(1), Duration::from_millis(200));
//! assert_eq!(backoff.delay(5), Duration::from_secs(2)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    MultiplierTooSmall { provided: f64 },
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MultiplierTooSmall { provided } => {
                write!(f, "multiplier must be > 1.0 (got {})", provided)
            }
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max_delay ({:?}) must be >= base_delay ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Exponential backoff with a cap and additive uniform jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Duration,
}

impl BackoffPolicy {
    /// Create a policy, validating that `multiplier > 1.0` and `max_delay >= base_delay`.
    ///
    /// A multiplier of exactly 1.0 is rejected: it would silently turn the
    /// exponential schedule into a constant one.
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: Duration,
    ) -> Result<Self, BackoffError> {
        if multiplier.is_nan() || multiplier <= 1.0 {
            return Err(BackoffError::MultiplierTooSmall { provided: multiplier });
        }
        if max_delay < base_delay {
            return Err(BackoffError::MaxLessThanBase { base: base_delay, max: max_delay });
        }
        Ok(Self { base_delay, max_delay, multiplier, jitter })
    }

    /// Base delay applied at attempt 0.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Cap on the exponential term (jitter is added after capping).
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Upper bound of the additive jitter draw.
    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// The non-jittered exponential term: `min(max_delay, base_delay × multiplier^attempt)`.
    ///
    /// Non-decreasing in `attempt` until the cap; saturates to `MAX_BACKOFF` on overflow.
    pub fn exponential_term(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let raw = if nanos.is_finite() && nanos >= 0.0 {
            let capped = nanos.min(MAX_BACKOFF.as_nanos() as f64);
            Duration::from_nanos(capped as u64)
        } else {
            MAX_BACKOFF
        };
        raw.min(self.max_delay).min(MAX_BACKOFF)
    }

    /// Calculate the delay for a failed attempt (0-based), drawing jitter from the
    /// thread-local RNG.
    pub fn delay(&self, attempt: usize) -> Duration {
        let mut rng = rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    /// Calculate the delay with a caller-supplied RNG (deterministic tests).
    pub fn delay_with_rng<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        let base = self.exponential_term(attempt);
        let jitter_millis = as_millis_saturated(self.jitter);
        if jitter_millis == 0 {
            return base;
        }
        let drawn = rng.random_range(0..=jitter_millis);
        base.saturating_add(Duration::from_millis(drawn)).min(MAX_BACKOFF)
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX) // Saturate extremely large durations
}
