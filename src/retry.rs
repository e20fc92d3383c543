//! Retry executor for fallible async operations.
//!
//! Semantics:
//! - `max_retries` counts retries beyond the first attempt, so an operation is
//!   invoked at most `max_retries + 1` times.
//! - An error is retryable when its message contains one of the configured
//!   retryable substrings, or contains one of the configured retryable HTTP
//!   status codes as a numeric token. Non-retryable errors propagate on the
//!   first failure without consuming retry budget.
//! - Backoff (with additive jitter) is slept between attempts; the `Sleeper`
//!   seam lets tests run without real delays.
//! - Every terminal outcome, success or exhaustion, is appended to the shared
//!   [`MetricsStore`] as an immutable [`RetryOutcome`].
//!
//! Configuration is per service name, with a generic default for unknown
//! services and an optional per-call override. The executor is an explicit
//! instance: construct one per subsystem (or per test) rather than sharing a
//! hidden global.
//!
//! Example
//! ```rust
//! use attendry_resilience::{MetricsStore, RetryExecutor};
//! use std::sync::Arc;
//!
//! # #[derive(Debug)] struct ApiError;
//! # impl std::fmt::Display for ApiError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "timeout") }
//! # }
//! # impl std::error::Error for ApiError {}
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let executor = RetryExecutor::new(Arc::new(MetricsStore::default()));
//! let retried = executor
//!     .execute("search", "find_events", || async { Ok::<_, ApiError>(3) })
//!     .await
//!     .unwrap();
//! assert_eq!(retried.value, 3);
//! assert_eq!(retried.outcome.attempts, 1);
//! # });
//! ```

use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, SystemClock};
use crate::error::MAX_RETRY_FAILURES;
use crate::metrics::{MetricsStore, RetryOutcome};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::ResilienceError;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Per-service retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries beyond the first attempt.
    pub max_retries: usize,
    pub backoff: BackoffPolicy,
    /// HTTP status codes treated as retryable when they appear as a token in an
    /// error message, or when returned by [`RetryExecutor::execute_http`].
    pub retryable_status_codes: BTreeSet<u16>,
    /// Lowercase substrings marking an error message as retryable.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    /// Safe generic default for unknown services: bounded retries, bounded delays.
    fn default() -> Self {
        let backoff = BackoffPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            2.0,
            Duration::from_millis(100),
        )
        .unwrap_or_else(|_| unreachable!("default backoff bounds are valid"));
        Self {
            max_retries: 3,
            backoff,
            retryable_status_codes: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            retryable_errors: [
                "timeout",
                "timed out",
                "econnreset",
                "econnrefused",
                "etimedout",
                "socket hang up",
                "fetch failed",
                "network",
                "connection reset",
                "connection refused",
                "rate limit",
                "temporarily unavailable",
                "service unavailable",
                "dns",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl RetryConfig {
    /// Default patterns/statuses with a caller-chosen retry count and backoff.
    pub fn with_backoff(max_retries: usize, backoff: BackoffPolicy) -> Self {
        Self { max_retries, backoff, ..Self::default() }
    }

    /// True if an error message matches a retryable substring or contains a
    /// retryable status code as a numeric token.
    pub fn is_retryable(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        if self.retryable_errors.iter().any(|p| lowered.contains(p.as_str())) {
            return true;
        }
        status_tokens(message).any(|code| self.retryable_status_codes.contains(&code))
    }

    /// Apply a per-call override on top of this config.
    pub fn merged(&self, overrides: &RetryOverride) -> Self {
        let mut merged = self.clone();
        if let Some(max_retries) = overrides.max_retries {
            merged.max_retries = max_retries;
        }
        if let Some(backoff) = &overrides.backoff {
            merged.backoff = backoff.clone();
        }
        merged
    }
}

/// Numeric tokens in a message, for status-code matching. Boundaries are any
/// non-digit, so "HTTP 503" and "status=503" both yield 503, while "50x" yields
/// nothing usable.
fn status_tokens(message: &str) -> impl Iterator<Item = u16> + '_ {
    message.split(|c: char| !c.is_ascii_digit()).filter(|t| !t.is_empty()).filter_map(|t| {
        // Only plausible HTTP status tokens
        if t.len() == 3 {
            t.parse::<u16>().ok()
        } else {
            None
        }
    })
}

/// Per-call override of a service's retry configuration.
#[derive(Debug, Clone, Default)]
pub struct RetryOverride {
    pub max_retries: Option<usize>,
    pub backoff: Option<BackoffPolicy>,
}

/// Successful result of a retried call, carrying the terminal outcome record.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub outcome: RetryOutcome,
}

/// Body of a successful HTTP-shaped call, as seen by [`RetryExecutor::execute_http`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOutcome<T> {
    pub status: u16,
    pub body: T,
}

/// Failure of an HTTP-shaped call: either the transport layer threw, or the
/// call completed with a status code configured as a retryable failure.
#[derive(Debug, Clone)]
pub enum HttpCallError<E> {
    Transport(E),
    Status { status: u16 },
}

impl<E: fmt::Display> fmt::Display for HttpCallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpCallError::Transport(e) => write!(f, "{}", e),
            HttpCallError::Status { status } => write!(f, "HTTP status {}", status),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for HttpCallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HttpCallError::Transport(e) => Some(e),
            HttpCallError::Status { .. } => None,
        }
    }
}

/// Retry executor with per-service configuration and shared outcome metrics.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    configs: Arc<HashMap<String, RetryConfig>>,
    default_config: RetryConfig,
    metrics: Arc<MetricsStore>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl RetryExecutor {
    /// Create an executor with the generic default config for every service.
    pub fn new(metrics: Arc<MetricsStore>) -> Self {
        Self {
            configs: Arc::new(HashMap::new()),
            default_config: RetryConfig::default(),
            metrics,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
        }
    }

    /// Install per-service configurations (replaces any existing table).
    pub fn with_configs(mut self, configs: HashMap<String, RetryConfig>) -> Self {
        self.configs = Arc::new(configs);
        self
    }

    /// Replace the fallback config used for unknown service names.
    pub fn with_default_config(mut self, config: RetryConfig) -> Self {
        self.default_config = config;
        self
    }

    /// Provide a custom sleeper implementation (tests use `InstantSleeper`/`TrackingSleeper`).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Override the clock used to stamp outcome records.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Resolved configuration for a service name.
    pub fn config_for(&self, service: &str) -> &RetryConfig {
        self.configs.get(service).unwrap_or(&self.default_config)
    }

    /// Shared metrics buffer receiving terminal outcomes.
    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    /// Execute `op` with retry semantics for `service`.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        service: &str,
        operation: &str,
        op: Op,
    ) -> Result<Retried<T>, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_with(service, operation, &RetryOverride::default(), op).await
    }

    /// Execute with a per-call override merged onto the service configuration.
    pub async fn execute_with<T, E, Fut, Op>(
        &self,
        service: &str,
        operation: &str,
        overrides: &RetryOverride,
        mut op: Op,
    ) -> Result<Retried<T>, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let config = self.config_for(service).merged(overrides);
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut total_delay = Duration::ZERO;

        for attempt in 0..=config.max_retries {
            match op().await {
                Ok(value) => {
                    let outcome = self.finish(
                        service,
                        operation,
                        attempt + 1,
                        total_delay,
                        true,
                        None,
                    );
                    return Ok(Retried { value, outcome });
                }
                Err(e) => {
                    let message = e.to_string();
                    if !config.is_retryable(&message) {
                        tracing::debug!(service, operation, %message, "non-retryable error");
                        self.finish(
                            service,
                            operation,
                            attempt + 1,
                            total_delay,
                            false,
                            Some(message),
                        );
                        return Err(ResilienceError::Inner(e));
                    }

                    failures.push_back(e);
                    while failures.len() > MAX_RETRY_FAILURES {
                        failures.pop_front();
                    }

                    if attempt >= config.max_retries {
                        tracing::warn!(
                            service,
                            operation,
                            attempts = attempt + 1,
                            "retry budget exhausted"
                        );
                        self.finish(
                            service,
                            operation,
                            attempt + 1,
                            total_delay,
                            false,
                            Some(message),
                        );
                        return Err(ResilienceError::retry_exhausted(
                            service,
                            attempt + 1,
                            failures.into_iter().collect(),
                        ));
                    }

                    let delay = config.backoff.delay(attempt);
                    total_delay += delay;
                    tracing::warn!(
                        service,
                        operation,
                        attempt = attempt + 1,
                        ?delay,
                        %message,
                        "retryable failure, backing off"
                    );
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // Loop always returns: success, non-retryable, or exhaustion on the last attempt.
        unreachable!("retry loop must return before falling through")
    }

    /// HTTP-shaped variant: a completed call whose status code is in the
    /// service's retryable set is treated as a retryable failure even though
    /// the transport did not throw. Statuses outside the set are returned to
    /// the caller as-is.
    pub async fn execute_http<T, E, Fut, Op>(
        &self,
        service: &str,
        operation: &str,
        mut op: Op,
    ) -> Result<Retried<HttpOutcome<T>>, ResilienceError<HttpCallError<E>>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpOutcome<T>, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let retryable_statuses = self.config_for(service).retryable_status_codes.clone();
        self.execute(service, operation, move || {
            let retryable_statuses = retryable_statuses.clone();
            let fut = op();
            async move {
                match fut.await {
                    Ok(outcome) if retryable_statuses.contains(&outcome.status) => {
                        Err(HttpCallError::Status { status: outcome.status })
                    }
                    Ok(outcome) => Ok(outcome),
                    Err(e) => Err(HttpCallError::Transport(e)),
                }
            }
        })
        .await
    }

    fn finish(
        &self,
        service: &str,
        operation: &str,
        attempts: usize,
        total_delay: Duration,
        succeeded: bool,
        last_error: Option<String>,
    ) -> RetryOutcome {
        let outcome = RetryOutcome {
            service: service.to_string(),
            operation: operation.to_string(),
            attempts,
            total_delay,
            succeeded,
            last_error,
            timestamp_millis: self.clock.now_millis(),
        };
        self.metrics.record(outcome.clone());
        outcome
    }
}
