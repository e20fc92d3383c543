//! Error types for the resilience layer
//!
//! One generic enum covers the whole taxonomy so callers can tell apart
//! "never attempted" (`CircuitOpen`), "attempted until policy gave up"
//! (`RetryExhausted`, `Timeout`), degraded-path refusals (`CacheUnavailable`,
//! `Unavailable`) and plain operation failures (`Inner`).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type for all resilience components.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The operation exceeded its timeout budget
    Timeout { elapsed: Duration, budget: Duration },
    /// The circuit breaker for the named service is open; the operation was never invoked
    CircuitOpen { service: String, failure_count: usize, open_for: Duration },
    /// All retry attempts for the named service were exhausted
    RetryExhausted { service: String, attempts: usize, failures: Arc<Vec<E>> },
    /// A cache-only fallback found no cached value; this strategy never fabricates data
    CacheUnavailable { service: String },
    /// A configured error-response fallback fired with its user-facing message
    Unavailable { service: String, message: String },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, budget } => {
                write!(f, "operation timed out after {:?} (budget: {:?})", elapsed, budget)
            }
            Self::CircuitOpen { service, failure_count, open_for } => {
                write!(
                    f,
                    "circuit breaker open for '{}' ({} failures, open for {:?})",
                    service, failure_count, open_for
                )
            }
            Self::RetryExhausted { service, attempts, failures } => {
                if let Some(last) = failures.last() {
                    write!(
                        f,
                        "retry exhausted for '{}' after {} attempts; last error: {}",
                        service, attempts, last
                    )
                } else {
                    write!(f, "retry exhausted for '{}' after {} attempts", service, attempts)
                }
            }
            Self::CacheUnavailable { service } => {
                write!(f, "cache-only fallback for '{}': no cached data available", service)
            }
            Self::Unavailable { service, message } => {
                write!(f, "'{}' unavailable: {}", service, message)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetryExhausted` variant, keeping only the most recent
    /// `MAX_RETRY_FAILURES` failures.
    pub fn retry_exhausted(service: impl Into<String>, attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        ResilienceError::RetryExhausted {
            service: service.into(),
            attempts,
            failures: Arc::new(trimmed),
        }
    }

    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error means the call was short-circuited without being attempted
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error came from a cache-only fallback with no cached value
    pub fn is_cache_unavailable(&self) -> bool {
        matches!(self, Self::CacheUnavailable { .. })
    }

    /// Check if this error is a configured error-response fallback
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access all recorded failures for RetryExhausted, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// Access retry exhaustion info as (attempts, recorded_failures).
    pub fn retry_exhausted_info(&self) -> Option<(usize, usize)> {
        match self {
            Self::RetryExhausted { attempts, failures, .. } => Some((*attempts, failures.len())),
            _ => None,
        }
    }

    /// Access timeout details as (elapsed, budget) if this is a timeout error.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, budget } => Some((*elapsed, *budget)),
            _ => None,
        }
    }

    /// Service name attached to this error, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { service, .. }
            | Self::RetryExhausted { service, .. }
            | Self::CacheUnavailable { service }
            | Self::Unavailable { service, .. } => Some(service),
            _ => None,
        }
    }
}
