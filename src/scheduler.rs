//! Adaptive parallel task scheduler.
//!
//! Accepts prioritized tasks bound to a backing service, groups them into
//! batches, and runs each batch concurrently with every task wrapped by the
//! [`RetryExecutor`] and its own timeout budget. High-priority tasks go out in
//! small batches before any normal-priority work. After each batch the
//! scheduler updates its rolling [`ParallelMetrics`] and nudges the
//! concurrency level one step up or down based on sampled resource pressure,
//! clamped to the configured bounds with distinct raise/lower thresholds so
//! the level does not oscillate.
//!
//! Individual task failures are captured into that task's [`TaskReport`] and
//! never abort siblings. Shutdown is cooperative: a flagged scheduler starts
//! no new batches but always lets the in-flight batch settle.

use crate::clock::{Clock, MonotonicClock};
use crate::retry::{RetryExecutor, RetryOverride};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::ResilienceError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Errors returned when validating scheduler configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerConfigError {
    #[error("concurrency bounds invalid: min {min} must be >= 1 and <= max {max}")]
    InvalidConcurrencyBounds { min: usize, max: usize },
    #[error("initial concurrency {initial} outside [{min}, {max}]")]
    InitialOutOfBounds { initial: usize, min: usize, max: usize },
    #[error("hysteresis inverted: lower threshold {lower} must exceed raise threshold {raise}")]
    InvertedHysteresis { raise: f64, lower: f64 },
}

/// Scheduler tuning knobs. All fields have safe defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    /// Tasks at or above this priority are dispatched first, in small batches.
    pub high_priority_threshold: f64,
    /// High-priority batch size is `min(concurrency, min_batch_size)`.
    pub min_batch_size: usize,
    /// Pressure below this (with positive throughput) raises concurrency.
    pub raise_threshold: f64,
    /// Pressure above this lowers concurrency.
    pub lower_threshold: f64,
    /// Timeout for tasks that do not carry their own budget.
    pub default_task_timeout: Duration,
    /// Pause between batches; zero disables it.
    pub inter_batch_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 8,
            initial_concurrency: 3,
            high_priority_threshold: 7.0,
            min_batch_size: 2,
            raise_threshold: 0.5,
            lower_threshold: 0.8,
            default_task_timeout: Duration::from_secs(30),
            inter_batch_delay: Duration::ZERO,
        }
    }
}

impl SchedulerConfig {
    /// Validate the bounds and hysteresis ordering.
    pub fn validate(&self) -> Result<(), SchedulerConfigError> {
        if self.min_concurrency == 0 || self.min_concurrency > self.max_concurrency {
            return Err(SchedulerConfigError::InvalidConcurrencyBounds {
                min: self.min_concurrency,
                max: self.max_concurrency,
            });
        }
        if self.initial_concurrency < self.min_concurrency
            || self.initial_concurrency > self.max_concurrency
        {
            return Err(SchedulerConfigError::InitialOutOfBounds {
                initial: self.initial_concurrency,
                min: self.min_concurrency,
                max: self.max_concurrency,
            });
        }
        if self.lower_threshold <= self.raise_threshold {
            return Err(SchedulerConfigError::InvertedHysteresis {
                raise: self.raise_threshold,
                lower: self.lower_threshold,
            });
        }
        Ok(())
    }
}

/// A unit of work submitted to the scheduler.
#[derive(Debug, Clone)]
pub struct ParallelTask<P> {
    pub id: String,
    pub service: String,
    pub payload: P,
    /// Higher is more urgent.
    pub priority: f64,
    /// Per-task retry override; `None` uses the service's configuration.
    pub max_retries: Option<usize>,
    /// Per-task timeout budget; `None` uses the scheduler default.
    pub timeout: Option<Duration>,
}

impl<P> ParallelTask<P> {
    pub fn new(id: impl Into<String>, service: impl Into<String>, payload: P) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            payload,
            priority: 0.0,
            max_retries: None,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal outcome of one task. Immutable once produced.
#[derive(Debug)]
pub struct TaskReport<R> {
    pub id: String,
    pub value: Option<R>,
    pub error: Option<String>,
    pub duration: Duration,
    pub attempts: usize,
    pub succeeded: bool,
}

/// Rolling scheduler-wide state, updated once per completed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelMetrics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Exponential running average across batches.
    pub average_duration_millis: f64,
    pub concurrency_level: usize,
    pub memory_fraction: f64,
    pub cpu_fraction: f64,
    /// Completed tasks per second since the current run started.
    pub throughput_per_sec: f64,
}

impl ParallelMetrics {
    fn new(concurrency_level: usize) -> Self {
        Self {
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            average_duration_millis: 0.0,
            concurrency_level,
            memory_fraction: 0.0,
            cpu_fraction: 0.0,
            throughput_per_sec: 0.0,
        }
    }
}

/// Sampled resource pressure, each value in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub memory_fraction: f64,
    pub cpu_fraction: f64,
}

impl ResourceSample {
    /// The signal the control law acts on.
    pub fn pressure(&self) -> f64 {
        self.memory_fraction.max(self.cpu_fraction)
    }
}

/// Source of resource-pressure samples for the adaptive control law.
pub trait ResourceMonitor: Send + Sync + fmt::Debug {
    fn sample(&self, active_tasks: usize, max_concurrency: usize, throughput: f64)
        -> ResourceSample;
}

/// Default monitor inferring pressure from the active-task ratio, dampened by
/// recent throughput: a saturated but fast pipeline reads as healthy. A proxy
/// for real OS sampling; substitute a host-metrics implementation if needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityMonitor;

impl ResourceMonitor for ActivityMonitor {
    fn sample(
        &self,
        active_tasks: usize,
        max_concurrency: usize,
        throughput: f64,
    ) -> ResourceSample {
        let ratio = (active_tasks as f64 / max_concurrency.max(1) as f64).clamp(0.0, 1.0);
        let damp = 1.0 / (1.0 + throughput.max(0.0));
        ResourceSample {
            memory_fraction: (ratio * 0.6 + 0.4 * ratio * damp).clamp(0.0, 1.0),
            cpu_fraction: ratio,
        }
    }
}

/// Early-termination rule: stop dispatching once at least `min_results`
/// successes exist and at least that many pass the quality predicate.
#[derive(Clone)]
pub struct EarlyStop<R> {
    pub min_results: usize,
    quality: Arc<dyn Fn(&R) -> bool + Send + Sync>,
}

impl<R> EarlyStop<R> {
    pub fn new(
        min_results: usize,
        quality: impl Fn(&R) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self { min_results, quality: Arc::new(quality) }
    }

    fn is_quality(&self, value: &R) -> bool {
        (self.quality)(value)
    }
}

impl<R> fmt::Debug for EarlyStop<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EarlyStop").field("min_results", &self.min_results).finish_non_exhaustive()
    }
}

/// Cloneable handle for shutdown and metrics observation.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shutdown: Arc<AtomicBool>,
    metrics: Arc<Mutex<ParallelMetrics>>,
}

impl SchedulerHandle {
    /// Stop new batches from starting. In-flight batches settle normally.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        tracing::info!("scheduler shutdown requested");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot of the rolling metrics.
    pub fn metrics(&self) -> ParallelMetrics {
        self.metrics.lock().expect("scheduler metrics poisoned").clone()
    }
}

/// Adaptive parallel processor. Cheap to clone; clones share metrics,
/// concurrency level, and the shutdown flag.
#[derive(Debug, Clone)]
pub struct ParallelScheduler {
    config: SchedulerConfig,
    retry: RetryExecutor,
    monitor: Arc<dyn ResourceMonitor>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    concurrency: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<Mutex<ParallelMetrics>>,
}

impl ParallelScheduler {
    /// Create a scheduler with validated configuration.
    pub fn new(config: SchedulerConfig, retry: RetryExecutor) -> Result<Self, SchedulerConfigError> {
        config.validate()?;
        let initial = config.initial_concurrency;
        Ok(Self {
            config,
            retry,
            monitor: Arc::new(ActivityMonitor),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            concurrency: Arc::new(AtomicUsize::new(initial)),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(Mutex::new(ParallelMetrics::new(initial))),
        })
    }

    pub fn with_monitor<M: ResourceMonitor + 'static>(mut self, monitor: M) -> Self {
        self.monitor = Arc::new(monitor);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Handle for shutdown and metrics observation.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { shutdown: self.shutdown.clone(), metrics: self.metrics.clone() }
    }

    /// Current adaptive concurrency level.
    pub fn concurrency_level(&self) -> usize {
        self.concurrency.load(Ordering::Acquire)
    }

    /// Process tasks with bounded, adaptive concurrency.
    ///
    /// Returns one report per processed task, in completion order within each
    /// batch. Tasks skipped by early termination or shutdown produce no
    /// report; they are dropped, not queued.
    pub async fn process<P, R, E, Fut, F>(
        &self,
        tasks: Vec<ParallelTask<P>>,
        processor: F,
        early_stop: Option<EarlyStop<R>>,
    ) -> Vec<TaskReport<R>>
    where
        P: Clone + Send + Sync,
        R: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send,
        F: Fn(P) -> Fut + Send + Sync,
    {
        let submitted = tasks.len();
        {
            let mut metrics = self.metrics.lock().expect("scheduler metrics poisoned");
            metrics.total_tasks += submitted;
        }

        let mut sorted = tasks;
        sorted.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        let (mut high, mut normal): (VecDeque<_>, VecDeque<_>) = {
            let threshold = self.config.high_priority_threshold;
            let mut high = VecDeque::new();
            let mut normal = VecDeque::new();
            for task in sorted {
                if task.priority >= threshold {
                    high.push_back(task);
                } else {
                    normal.push_back(task);
                }
            }
            (high, normal)
        };

        let run_started = self.clock.now_millis();
        let mut reports: Vec<TaskReport<R>> = Vec::with_capacity(submitted);
        let mut successes = 0usize;
        let mut quality_hits = 0usize;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                let dropped = high.len() + normal.len();
                if dropped > 0 {
                    tracing::info!(dropped, "scheduler shut down with tasks remaining");
                }
                break;
            }
            let concurrency = self.concurrency.load(Ordering::Acquire);
            let batch: Vec<ParallelTask<P>> = if !high.is_empty() {
                let size = concurrency.min(self.config.min_batch_size).max(1);
                high.drain(..size.min(high.len())).collect()
            } else if !normal.is_empty() {
                normal.drain(..concurrency.min(normal.len())).collect()
            } else {
                break;
            };

            let batch_size = batch.len();
            let batch_reports = futures::future::join_all(
                batch.into_iter().map(|task| self.run_task(task, &processor)),
            )
            .await;

            for report in &batch_reports {
                if report.succeeded {
                    successes += 1;
                    if let (Some(stop), Some(value)) = (&early_stop, &report.value) {
                        if stop.is_quality(value) {
                            quality_hits += 1;
                        }
                    }
                }
            }
            // Metrics are applied once per settled batch, never per task
            self.apply_batch_metrics(&batch_reports, run_started, batch_size);
            reports.extend(batch_reports);

            if let Some(stop) = &early_stop {
                if successes >= stop.min_results && quality_hits >= stop.min_results {
                    let dropped = high.len() + normal.len();
                    tracing::info!(
                        successes,
                        quality_hits,
                        dropped,
                        "early termination: enough high-quality results"
                    );
                    break;
                }
            }

            let more_work = !high.is_empty() || !normal.is_empty();
            if more_work && self.config.inter_batch_delay > Duration::ZERO {
                self.sleeper.sleep(self.config.inter_batch_delay).await;
            }
        }

        reports
    }

    async fn run_task<P, R, E, Fut, F>(
        &self,
        task: ParallelTask<P>,
        processor: &F,
    ) -> TaskReport<R>
    where
        P: Clone + Send + Sync,
        R: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send,
        F: Fn(P) -> Fut + Send + Sync,
    {
        let budget = task.timeout.unwrap_or(self.config.default_task_timeout);
        let overrides = RetryOverride { max_retries: task.max_retries, backoff: None };
        let started = self.clock.now_millis();

        let payload = task.payload;
        let attempt = self.retry.execute_with(&task.service, &task.id, &overrides, || {
            processor(payload.clone())
        });

        let outcome = tokio::time::timeout(budget, attempt).await;
        let duration = Duration::from_millis(self.clock.now_millis().saturating_sub(started));

        match outcome {
            Ok(Ok(retried)) => TaskReport {
                id: task.id,
                value: Some(retried.value),
                error: None,
                duration,
                attempts: retried.outcome.attempts,
                succeeded: true,
            },
            Ok(Err(err)) => {
                let attempts = err.retry_exhausted_info().map(|(a, _)| a).unwrap_or(1);
                tracing::warn!(task = %task.id, service = %task.service, error = %err, "task failed");
                TaskReport {
                    id: task.id,
                    value: None,
                    error: Some(err.to_string()),
                    duration,
                    attempts,
                    succeeded: false,
                }
            }
            Err(_) => {
                let err: ResilienceError<E> =
                    ResilienceError::Timeout { elapsed: duration, budget };
                tracing::warn!(task = %task.id, service = %task.service, "task exceeded its timeout budget");
                TaskReport {
                    id: task.id,
                    value: None,
                    error: Some(err.to_string()),
                    duration,
                    attempts: 0,
                    succeeded: false,
                }
            }
        }
    }

    /// Post-join metrics update and one step of the adaptive control law.
    fn apply_batch_metrics<R>(
        &self,
        batch: &[TaskReport<R>],
        run_started_millis: u64,
        batch_size: usize,
    ) {
        let batch_completed = batch.iter().filter(|r| r.succeeded).count();
        let batch_failed = batch.len() - batch_completed;
        let batch_avg = if batch.is_empty() {
            0.0
        } else {
            batch.iter().map(|r| r.duration.as_millis() as f64).sum::<f64>() / batch.len() as f64
        };

        let mut metrics = self.metrics.lock().expect("scheduler metrics poisoned");
        metrics.completed_tasks += batch_completed;
        metrics.failed_tasks += batch_failed;
        metrics.average_duration_millis = if metrics.average_duration_millis == 0.0 {
            batch_avg
        } else {
            metrics.average_duration_millis * 0.7 + batch_avg * 0.3
        };

        let elapsed_secs =
            (self.clock.now_millis().saturating_sub(run_started_millis)) as f64 / 1_000.0;
        metrics.throughput_per_sec = if elapsed_secs > 0.0 {
            metrics.completed_tasks as f64 / elapsed_secs
        } else {
            metrics.completed_tasks as f64
        };

        let sample = self.monitor.sample(
            batch_size,
            self.config.max_concurrency,
            metrics.throughput_per_sec,
        );
        metrics.memory_fraction = sample.memory_fraction;
        metrics.cpu_fraction = sample.cpu_fraction;

        let current = self.concurrency.load(Ordering::Acquire);
        let pressure = sample.pressure();
        let next = if pressure > self.config.lower_threshold {
            current.saturating_sub(1).max(self.config.min_concurrency)
        } else if pressure < self.config.raise_threshold && metrics.throughput_per_sec > 0.0 {
            (current + 1).min(self.config.max_concurrency)
        } else {
            current
        };
        if next != current {
            tracing::debug!(from = current, to = next, pressure, "adaptive concurrency step");
            self.concurrency.store(next, Ordering::Release);
        }
        metrics.concurrency_level = next;
    }
}
