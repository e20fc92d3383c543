//! Retry outcome records and the bounded in-memory metrics buffer.
//!
//! Every completed retry sequence (succeeded or exhausted) produces exactly one
//! immutable [`RetryOutcome`]. Outcomes land in a capped ring buffer, oldest
//! evicted first, and are aggregated on demand for the health read model.
//!
//! The store is an explicit instance handed to each executor, not a process-wide
//! singleton, so independent executors in one process can keep isolated buffers.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Default ring buffer capacity.
pub const DEFAULT_METRICS_CAPACITY: usize = 1_000;

/// One completed retry sequence. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub service: String,
    pub operation: String,
    /// Attempts actually made, in `[1, max_retries + 1]`.
    pub attempts: usize,
    /// Sum of all backoff sleeps across the sequence.
    pub total_delay: Duration,
    pub succeeded: bool,
    pub last_error: Option<String>,
    /// Epoch milliseconds at completion.
    pub timestamp_millis: u64,
}

/// Aggregate view over the buffered outcomes for one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStats {
    pub service: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Fraction of outcomes that ended in failure.
    pub error_rate: f64,
    /// Fraction of outcomes that needed more than one attempt.
    pub retry_rate: f64,
    pub average_attempts: f64,
}

/// Bounded, shared buffer of retry outcomes.
#[derive(Debug)]
pub struct MetricsStore {
    inner: Mutex<VecDeque<RetryOutcome>>,
    capacity: usize,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_CAPACITY)
    }
}

impl MetricsStore {
    /// Create a store keeping at most `capacity` recent outcomes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::new()), capacity: capacity.max(1) }
    }

    /// Append an outcome, evicting the oldest past capacity.
    pub fn record(&self, outcome: RetryOutcome) {
        let mut buf = self.inner.lock().expect("metrics buffer poisoned");
        buf.push_back(outcome);
        while buf.len() > self.capacity {
            buf.pop_front();
        }
    }

    /// Snapshot of the buffered outcomes, oldest first.
    pub fn recent(&self) -> Vec<RetryOutcome> {
        self.inner.lock().expect("metrics buffer poisoned").iter().cloned().collect()
    }

    /// Number of buffered outcomes.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics buffer poisoned").len()
    }

    /// True if nothing has been recorded (or everything evicted).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct service names present in the buffer, sorted.
    pub fn services(&self) -> Vec<String> {
        let buf = self.inner.lock().expect("metrics buffer poisoned");
        let mut names: Vec<String> = buf.iter().map(|o| o.service.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Aggregate the buffered outcomes for one service.
    pub fn service_stats(&self, service: &str) -> ServiceStats {
        let buf = self.inner.lock().expect("metrics buffer poisoned");
        let mut total = 0usize;
        let mut succeeded = 0usize;
        let mut retried = 0usize;
        let mut attempts_sum = 0usize;
        for outcome in buf.iter().filter(|o| o.service == service) {
            total += 1;
            if outcome.succeeded {
                succeeded += 1;
            }
            if outcome.attempts > 1 {
                retried += 1;
            }
            attempts_sum += outcome.attempts;
        }
        let failed = total - succeeded;
        let denom = total.max(1) as f64;
        ServiceStats {
            service: service.to_string(),
            total,
            succeeded,
            failed,
            error_rate: failed as f64 / denom,
            retry_rate: retried as f64 / denom,
            average_attempts: attempts_sum as f64 / denom,
        }
    }
}
