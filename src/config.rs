//! External configuration surface.
//!
//! Everything tunable from outside lives here as plain serde structs with safe
//! defaults, so an absent or partial configuration still yields bounded
//! retries and bounded concurrency. The raw settings validate into the
//! component config types (`RetryConfig`, `CircuitBreakerConfig`, …) via the
//! `build`/`*_configs` methods; invalid numbers surface as [`ConfigError`]
//! instead of panics.

use crate::backoff::{BackoffError, BackoffPolicy};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::cost::{BudgetConfig, Pricing, PricingTable};
use crate::fallback::FallbackStrategy;
use crate::metrics::DEFAULT_METRICS_CAPACITY;
use crate::retry::RetryConfig;
use crate::scheduler::{SchedulerConfig, SchedulerConfigError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A settings value failed validation while building component configs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("retry settings for '{service}': {source}")]
    Retry {
        service: String,
        #[source]
        source: BackoffError,
    },
    #[error("breaker settings for '{service}': {source}")]
    Breaker {
        service: String,
        #[source]
        source: CircuitBreakerError,
    },
    #[error(transparent)]
    Scheduler(#[from] SchedulerConfigError),
}

/// Raw retry settings as they appear in external configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Empty means "use the built-in defaults".
    pub retryable_status_codes: Vec<u16>,
    /// Empty means "use the built-in defaults".
    pub retryable_errors: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 100,
            retryable_status_codes: Vec::new(),
            retryable_errors: Vec::new(),
        }
    }
}

impl RetrySettings {
    /// Validate into a [`RetryConfig`].
    pub fn build(&self) -> Result<RetryConfig, BackoffError> {
        let backoff = BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
            Duration::from_millis(self.jitter_ms),
        )?;
        let mut config = RetryConfig::with_backoff(self.max_retries, backoff);
        if !self.retryable_status_codes.is_empty() {
            config.retryable_status_codes = self.retryable_status_codes.iter().copied().collect();
        }
        if !self.retryable_errors.is_empty() {
            config.retryable_errors =
                self.retryable_errors.iter().map(|p| p.to_lowercase()).collect();
        }
        Ok(config)
    }
}

/// Raw circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    pub cooldown_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown_secs: 60 }
    }
}

impl BreakerSettings {
    pub fn build(&self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        CircuitBreakerConfig::new(self.failure_threshold, Duration::from_secs(self.cooldown_secs))
    }
}

/// Everything configurable for one named service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub fallbacks: Vec<FallbackStrategy>,
}

/// Top-level configuration for the resilience layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub services: HashMap<String, ServiceSettings>,
    pub scheduler: SchedulerConfig,
    pub pricing: PricingTable,
    pub budget: BudgetConfig,
    pub metrics_capacity: Option<usize>,
}

impl ResilienceConfig {
    /// Validate every section without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry_configs()?;
        self.breaker_configs()?;
        self.scheduler.validate()?;
        Ok(())
    }

    /// Per-service retry configs for [`crate::retry::RetryExecutor`].
    pub fn retry_configs(&self) -> Result<HashMap<String, RetryConfig>, ConfigError> {
        self.services
            .iter()
            .map(|(name, settings)| {
                settings
                    .retry
                    .build()
                    .map(|config| (name.clone(), config))
                    .map_err(|source| ConfigError::Retry { service: name.clone(), source })
            })
            .collect()
    }

    /// Per-service breaker configs for [`crate::circuit_breaker::CircuitBreakerSet`].
    pub fn breaker_configs(&self) -> Result<HashMap<String, CircuitBreakerConfig>, ConfigError> {
        self.services
            .iter()
            .map(|(name, settings)| {
                settings
                    .breaker
                    .build()
                    .map(|config| (name.clone(), config))
                    .map_err(|source| ConfigError::Breaker { service: name.clone(), source })
            })
            .collect()
    }

    /// Per-service fallback chains for [`crate::fallback::FallbackSelector`].
    pub fn fallback_strategies(&self) -> HashMap<String, Vec<FallbackStrategy>> {
        self.services
            .iter()
            .filter(|(_, settings)| !settings.fallbacks.is_empty())
            .map(|(name, settings)| (name.clone(), settings.fallbacks.clone()))
            .collect()
    }

    /// Ring buffer capacity for retry outcome metrics.
    pub fn metrics_capacity(&self) -> usize {
        self.metrics_capacity.unwrap_or(DEFAULT_METRICS_CAPACITY)
    }

    /// Tuned presets for the services the application actually talks to:
    /// search, crawl, llm, and email.
    pub fn recommended() -> Self {
        let mut services = HashMap::new();

        services.insert(
            "search".to_string(),
            ServiceSettings {
                retry: RetrySettings { max_retries: 3, base_delay_ms: 500, ..Default::default() },
                breaker: BreakerSettings { failure_threshold: 5, cooldown_secs: 60 },
                fallbacks: vec![
                    FallbackStrategy::CacheOnly,
                    FallbackStrategy::ReducedFunctionality {
                        disabled_features: vec!["ai-ranking".to_string()],
                    },
                ],
            },
        );
        services.insert(
            "crawl".to_string(),
            ServiceSettings {
                retry: RetrySettings {
                    max_retries: 2,
                    base_delay_ms: 2_000,
                    max_delay_ms: 60_000,
                    ..Default::default()
                },
                breaker: BreakerSettings { failure_threshold: 5, cooldown_secs: 90 },
                fallbacks: vec![FallbackStrategy::CacheOnly],
            },
        );
        services.insert(
            "llm".to_string(),
            ServiceSettings {
                // LLM providers rate-limit aggressively; wider backoff window
                retry: RetrySettings {
                    max_retries: 3,
                    base_delay_ms: 1_000,
                    max_delay_ms: 120_000,
                    jitter_ms: 500,
                    ..Default::default()
                },
                breaker: BreakerSettings { failure_threshold: 3, cooldown_secs: 120 },
                fallbacks: vec![FallbackStrategy::CacheOnly],
            },
        );
        services.insert(
            "email".to_string(),
            ServiceSettings {
                retry: RetrySettings {
                    max_retries: 4,
                    base_delay_ms: 5_000,
                    max_delay_ms: 300_000,
                    ..Default::default()
                },
                breaker: BreakerSettings { failure_threshold: 3, cooldown_secs: 300 },
                fallbacks: vec![FallbackStrategy::ErrorResponse {
                    message: "Email delivery is temporarily unavailable; your message was not sent."
                        .to_string(),
                }],
            },
        );

        Self {
            services,
            scheduler: SchedulerConfig::default(),
            pricing: PricingTable::new()
                .with_service("search", Pricing::FlatPerCall { usd: 0.005 })
                .with_service("crawl", Pricing::FlatPerCall { usd: 0.002 })
                .with_service(
                    "llm",
                    Pricing::PerToken { input_per_1k_usd: 0.003, output_per_1k_usd: 0.015 },
                ),
            budget: BudgetConfig::default(),
            metrics_capacity: None,
        }
    }
}
