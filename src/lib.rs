#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Attendry Resilience
//!
//! Resilience and orchestration primitives for the unreliable external calls
//! behind a business-events platform: search providers, web crawlers, and
//! LLM extraction, all of which can fail, hang, or rate-limit.
//!
//! ## Features
//!
//! - **Retry with backoff** per service, with message/status-based error
//!   classification and capped, jittered exponential delays
//! - **Circuit breakers** per service with half-open probe recovery
//! - **Fallback chains** (cache, demo data, reduced scope, alternate backend,
//!   hard error) walked once when the primary path fails
//! - **Adaptive parallel scheduling** with priority batches, per-task timeout
//!   budgets, and a ±1 concurrency control law with hysteresis
//! - **LLM request batching** with id-correlated demultiplexing and
//!   heuristic fallback for malformed responses
//! - **Cost accounting** with flat or token-tiered pricing, cache-hit
//!   savings, and advisory budgets
//! - **Health read model** combining recent outcomes and breaker state
//!
//! ## Quick Start
//!
//! ```rust
//! use attendry_resilience::{MetricsStore, RetryExecutor, ResilienceError};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = RetryExecutor::new(Arc::new(MetricsStore::default()));
//!
//!     let result = executor
//!         .execute("search", "find-events", || async {
//!             // Your provider call here
//!             Ok::<_, std::io::Error>(vec!["FinTech Summit"])
//!         })
//!         .await;
//!
//!     match result {
//!         Ok(retried) => println!("{} events after {} attempt(s)", retried.value.len(), retried.outcome.attempts),
//!         Err(ResilienceError::RetryExhausted { attempts, .. }) => eprintln!("gave up after {attempts}"),
//!         Err(other) => eprintln!("{other}"),
//!     }
//! }
//! ```

pub mod backoff;
pub mod batch;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod cost;
pub mod error;
pub mod fallback;
pub mod health;
pub mod json_repair;
pub mod messages;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod sleeper;
pub mod store;

// Re-exports
pub use backoff::{BackoffError, BackoffPolicy, MAX_BACKOFF};
pub use batch::{
    dedupe_entities, BatchAggregator, BatchItem, BatchKind, BatchProvider, BatchProviderError,
    EventPrioritization, ItemOrigin, ItemResult, SpeakerExtraction, DEFAULT_CHUNK_SIZE,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSet, CircuitSnapshot,
    CircuitState,
};
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use config::{BreakerSettings, ConfigError, ResilienceConfig, RetrySettings, ServiceSettings};
pub use cost::{
    BudgetAlert, BudgetConfig, BudgetWindow, CallUsage, CostRecord, CostSummary, CostTracker,
    Pricing, PricingTable, TokenUsage,
};
pub use error::ResilienceError;
pub use fallback::{Degraded, FallbackSelector, FallbackStrategy, ServedBy};
pub use health::{HealthReporter, HealthStatus, HealthThresholds, ServiceHealth};
pub use json_repair::{parse_lenient, JsonRepairError, Parsed};
pub use messages::{map_error, map_error_for, ErrorCategory, UserMessage};
pub use metrics::{MetricsStore, RetryOutcome, ServiceStats};
pub use retry::{
    HttpCallError, HttpOutcome, Retried, RetryConfig, RetryExecutor, RetryOverride,
};
pub use scheduler::{
    EarlyStop, ParallelMetrics, ParallelScheduler, ParallelTask, ResourceMonitor, ResourceSample,
    SchedulerConfig, SchedulerHandle, TaskReport,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{
    CostQuery, CostRecordStore, KeyValueStore, MemoryCostRecordStore, MemoryKeyValueStore,
    StoreError,
};
