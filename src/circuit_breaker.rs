//! Per-service circuit breakers with lock-free atomics.
//!
//! Each service name gets its own CLOSED → OPEN → HALF_OPEN state machine:
//! `failure_threshold` consecutive failures open the circuit, calls are then
//! short-circuited with a distinct [`ResilienceError::CircuitOpen`] (so fallback
//! logic can tell "never attempted" from "attempted and failed"), and after the
//! cool-down elapses exactly one trial call probes the dependency. A successful
//! probe closes the circuit; a failed probe reopens it and restarts the
//! cool-down.
//!
//! Breakers live in a [`CircuitBreakerSet`] keyed by service name, created
//! lazily from injected per-service configuration. The set exposes a read-only
//! [`CircuitBreakerSet::snapshot`] of every service's state for health
//! reporting.

use crate::clock::{Clock, MonotonicClock};
use crate::ResilienceError;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Only one trial call is permitted while half-open.
const HALF_OPEN_MAX_CALLS: usize = 1;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cool-down elapses.
    Open,
    /// Probe mode allowing a single call to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> CircuitState {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Validated configuration for one breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    cooldown: Duration,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("cooldown must be > 0 unless breaker is disabled (got {0:?})")]
    InvalidCooldown(Duration),
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        let disabled = failure_threshold == usize::MAX;
        if cooldown == Duration::ZERO && !disabled {
            return Err(CircuitBreakerError::InvalidCooldown(cooldown));
        }
        Ok(Self { failure_threshold, cooldown })
    }

    /// A breaker that never opens (`usize::MAX` threshold).
    pub fn disabled() -> Self {
        Self { failure_threshold: usize::MAX, cooldown: Duration::MAX }
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Duration to stay Open before the half-open probe.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for CircuitBreakerConfig {
    /// 5 consecutive failures, 60s cool-down.
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(60) }
    }
}

/// Read-only view of one breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    /// Clock millis of the most recent failure, if any.
    pub last_failure_millis: Option<u64>,
    /// Clock millis of the most recent state transition, if any.
    pub last_transition_millis: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    last_failure_millis: AtomicU64,
    last_transition_millis: AtomicU64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
            last_failure_millis: AtomicU64::new(0),
            last_transition_millis: AtomicU64::new(0),
        }
    }
}

/// Circuit breaker guarding one named service.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and
/// affect the same circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    service: String,
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker for `service` with a validated config.
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            state: Arc::new(BreakerState::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Service name this breaker guards.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Execute `op` under circuit-breaker protection.
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without invoking `op` while the
    /// circuit is open or the single half-open probe slot is taken; otherwise
    /// the operation's own failure surfaces as `ResilienceError::Inner`.
    pub async fn execute<T, E, Fut, Op>(&self, op: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        struct ProbeGuard<'a> {
            state: &'a BreakerState,
            did_increment: bool,
        }
        impl Drop for ProbeGuard<'_> {
            fn drop(&mut self) {
                if self.did_increment {
                    self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                }
            }
        }
        let mut guard: Option<ProbeGuard<'_>> = None;

        loop {
            let current = CircuitState::from_u8(self.state.state.load(Ordering::Acquire));
            match current {
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= millis_saturated(self.config.cooldown) {
                        match self.state.state.compare_exchange(
                            CircuitState::Open.to_u8(),
                            CircuitState::HalfOpen.to_u8(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                // Won the race: this call is the half-open probe
                                self.state.half_open_calls.store(1, Ordering::Release);
                                self.state.last_transition_millis.store(now, Ordering::Release);
                                tracing::info!(service = %self.service, "circuit breaker → half-open");
                                guard =
                                    Some(ProbeGuard { state: &self.state, did_increment: true });
                                break;
                            }
                            Err(actual) if actual == STATE_CLOSED => break,
                            Err(_) => continue, // someone else went half-open; re-check
                        }
                    } else {
                        return Err(self.open_error(elapsed));
                    }
                }
                CircuitState::HalfOpen => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= HALF_OPEN_MAX_CALLS {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                        return Err(self.open_error(elapsed));
                    }
                    guard = Some(ProbeGuard { state: &self.state, did_increment: true });
                    tracing::debug!(service = %self.service, "circuit breaker: half-open probe");
                    break;
                }
                CircuitState::Closed => break,
            }
        }

        let result = op().await;
        drop(guard);

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result.map_err(ResilienceError::Inner)
    }

    /// Read-only snapshot of this breaker.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let last_failure = self.state.last_failure_millis.load(Ordering::Acquire);
        let last_transition = self.state.last_transition_millis.load(Ordering::Acquire);
        CircuitSnapshot {
            state: CircuitState::from_u8(self.state.state.load(Ordering::Acquire)),
            consecutive_failures: self.state.failure_count.load(Ordering::Acquire),
            last_failure_millis: (last_failure > 0).then_some(last_failure),
            last_transition_millis: (last_transition > 0).then_some(last_transition),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    /// Force the breaker back to Closed, clearing all counters.
    pub fn reset(&self) {
        self.state.state.store(CircuitState::Closed.to_u8(), Ordering::Release);
        self.state.failure_count.store(0, Ordering::Release);
        self.state.half_open_calls.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.last_transition_millis.store(self.clock.now_millis(), Ordering::Release);
        tracing::info!(service = %self.service, "circuit breaker manually reset");
    }

    fn open_error<E>(&self, elapsed_millis: u64) -> ResilienceError<E> {
        ResilienceError::CircuitOpen {
            service: self.service.clone(),
            failure_count: self.state.failure_count.load(Ordering::Acquire),
            open_for: Duration::from_millis(elapsed_millis),
        }
    }

    /// Any success in the closed state resets the consecutive-failure counter, so
    /// only an unbroken failure streak of `failure_threshold` trips the breaker.
    fn on_success(&self) {
        match CircuitState::from_u8(self.state.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        CircuitState::HalfOpen.to_u8(),
                        CircuitState::Closed.to_u8(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    self.state
                        .last_transition_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    tracing::info!(service = %self.service, "circuit breaker → closed");
                }
            }
            CircuitState::Closed => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();
        self.state.last_failure_millis.store(now, Ordering::Release);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match CircuitState::from_u8(self.state.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        CircuitState::HalfOpen.to_u8(),
                        CircuitState::Open.to_u8(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    self.state.last_transition_millis.store(now, Ordering::Release);
                    tracing::warn!(service = %self.service, "circuit breaker: probe failed → open");
                }
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            CircuitState::Closed.to_u8(),
                            CircuitState::Open.to_u8(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    self.state.last_transition_millis.store(now, Ordering::Release);
                    tracing::error!(
                        service = %self.service,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Named breakers, created lazily from injected per-service configuration.
///
/// An explicit instance rather than a process-wide singleton: independent sets
/// can coexist in one process (isolated tests, multiple pipelines).
#[derive(Debug, Clone)]
pub struct CircuitBreakerSet {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    configs: Arc<HashMap<String, CircuitBreakerConfig>>,
    default_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::new(HashMap::new(), CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerSet {
    /// Create a set with per-service configs and a default for unknown names.
    pub fn new(
        configs: HashMap<String, CircuitBreakerConfig>,
        default_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            configs: Arc::new(configs),
            default_config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock used by breakers created after this call.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Execute `op` under the breaker for `service`, creating it on first use.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        service: &str,
        op: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.breaker(service).execute(op).await
    }

    /// Get (or lazily create) the breaker for a service.
    pub fn breaker(&self, service: &str) -> CircuitBreaker {
        if let Some(existing) =
            self.breakers.read().expect("breaker set poisoned").get(service)
        {
            return existing.clone();
        }
        let mut map = self.breakers.write().expect("breaker set poisoned");
        map.entry(service.to_string())
            .or_insert_with(|| {
                let config =
                    self.configs.get(service).cloned().unwrap_or_else(|| self.default_config.clone());
                CircuitBreaker {
                    service: service.to_string(),
                    state: Arc::new(BreakerState::new()),
                    config,
                    clock: self.clock.clone(),
                }
            })
            .clone()
    }

    /// Current state of a service's breaker; `Closed` if never used.
    pub fn state(&self, service: &str) -> CircuitState {
        self.breakers
            .read()
            .expect("breaker set poisoned")
            .get(service)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Reset a service's breaker to Closed, if it exists.
    pub fn reset(&self, service: &str) {
        if let Some(breaker) = self.breakers.read().expect("breaker set poisoned").get(service) {
            breaker.reset();
        }
    }

    /// Read-only snapshot of all known breakers, sorted by service name.
    pub fn snapshot(&self) -> Vec<(String, CircuitSnapshot)> {
        let map = self.breakers.read().expect("breaker set poisoned");
        let mut entries: Vec<(String, CircuitSnapshot)> =
            map.iter().map(|(name, breaker)| (name.clone(), breaker.snapshot())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

fn millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(1)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn breaker(threshold: usize, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-svc",
            CircuitBreakerConfig::new(threshold, Duration::from_millis(cooldown_ms)).unwrap(),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError<TestError>> {
        breaker.execute(|| async { Err::<(), _>(TestError("fail".into())) }).await
    }

    #[test]
    fn rejects_zero_threshold_and_zero_cooldown() {
        assert!(matches!(
            CircuitBreakerConfig::new(0, Duration::from_secs(1)),
            Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 })
        ));
        assert!(matches!(
            CircuitBreakerConfig::new(3, Duration::ZERO),
            Err(CircuitBreakerError::InvalidCooldown(Duration::ZERO))
        ));
        assert!(CircuitBreakerConfig::disabled().failure_threshold() == usize::MAX);
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let breaker = breaker(3, 10_000);
        let calls = Arc::new(AtomicUsize::new(0));

        // Calls 1-3: operation is invoked and fails normally
        for _ in 0..3 {
            let calls_clone = calls.clone();
            let result = breaker
                .execute(|| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TestError("fail".into()))
                    }
                })
                .await;
            assert!(result.unwrap_err().is_inner());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Call 4: short-circuited, operation NOT invoked
        let calls_clone = calls.clone();
        let result = breaker
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(42)
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.service(), Some("test-svc"));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "operation must not run while open");
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_streak() {
        let breaker = breaker(3, 10_000);

        for _ in 0..2 {
            let _ = fail(&breaker).await;
        }
        let _ = breaker.execute(|| async { Ok::<_, TestError>(1) }).await;
        for _ in 0..2 {
            let result = fail(&breaker).await;
            // Operation still runs: streak was reset, breaker stays closed
            assert!(result.unwrap_err().is_inner());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn recovers_through_half_open_with_manual_clock() {
        let clock = ManualClock::new();
        let breaker = breaker(1, 100).with_clock(clock.clone());

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Still inside cool-down: short-circuited
        let result = breaker.execute(|| async { Ok::<_, TestError>(1) }).await;
        assert!(result.unwrap_err().is_circuit_open());

        clock.advance(150);

        // Probe succeeds → closed
        let value = breaker.execute(|| async { Ok::<_, TestError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failed_probe_reopens_and_restarts_cooldown() {
        let clock = ManualClock::new();
        let breaker = breaker(1, 100).with_clock(clock.clone());

        let _ = fail(&breaker).await;
        clock.advance(150);

        // Probe fails → back to open
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Cool-down restarted: an immediate call is still short-circuited
        let result = breaker.execute(|| async { Ok::<_, TestError>(1) }).await;
        assert!(result.unwrap_err().is_circuit_open());

        // A fresh cool-down later, recovery works
        clock.advance(150);
        let value = breaker.execute(|| async { Ok::<_, TestError>(9) }).await.unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn half_open_permits_exactly_one_probe() {
        let clock = ManualClock::new();
        let breaker = breaker(1, 50).with_clock(clock.clone());
        let _ = fail(&breaker).await;
        clock.advance(100);

        let barrier = Arc::new(tokio::sync::Barrier::new(3));
        let entered = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..3 {
            let b = breaker.clone();
            let gate = barrier.clone();
            let entered = entered.clone();
            handles.push(tokio::spawn(async move {
                gate.wait().await;
                b.execute(|| {
                    let entered = entered.clone();
                    async move {
                        entered.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, TestError>(1)
                    }
                })
                .await
            }));
        }

        let results = futures::future::join_all(handles).await;
        let successes =
            results.iter().filter(|r| r.as_ref().expect("join error").is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| {
                r.as_ref()
                    .expect("join error")
                    .as_ref()
                    .err()
                    .is_some_and(|e| e.is_circuit_open())
            })
            .count();

        assert_eq!(successes, 1, "only the probe call may run half-open");
        assert_eq!(rejected, 2);
        assert!(entered.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::disabled());
        for _ in 0..100 {
            let result = fail(&breaker).await;
            assert!(result.unwrap_err().is_inner());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn set_isolates_services_and_snapshots_sorted() {
        let mut configs = HashMap::new();
        configs.insert(
            "flaky".to_string(),
            CircuitBreakerConfig::new(1, Duration::from_secs(60)).unwrap(),
        );
        let set = CircuitBreakerSet::new(configs, CircuitBreakerConfig::default());

        let _ = set.execute("flaky", || async { Err::<(), _>(TestError("x".into())) }).await;
        let ok = set.execute("steady", || async { Ok::<_, TestError>(1) }).await;
        assert!(ok.is_ok());

        assert_eq!(set.state("flaky"), CircuitState::Open);
        assert_eq!(set.state("steady"), CircuitState::Closed);
        assert_eq!(set.state("unknown"), CircuitState::Closed);

        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "flaky");
        assert_eq!(snapshot[0].1.state, CircuitState::Open);
        assert_eq!(snapshot[1].0, "steady");

        set.reset("flaky");
        assert_eq!(set.state("flaky"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opening_emits_a_structured_transition_log() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let breaker = breaker(1, 10_000);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(
            logs.contains("circuit breaker") && logs.contains("open"),
            "opening must be logged: {}",
            logs
        );
        assert!(logs.contains("test-svc"), "log must name the service: {}", logs);
    }

    #[tokio::test]
    async fn open_error_reports_failure_count() {
        let breaker = breaker(2, 10_000);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let err = breaker.execute(|| async { Ok::<_, TestError>(1) }).await.unwrap_err();
        match err {
            ResilienceError::CircuitOpen { failure_count, .. } => assert_eq!(failure_count, 2),
            e => panic!("expected CircuitOpen, got {:?}", e),
        }
    }
}
