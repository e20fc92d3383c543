//! Graceful degradation strategies invoked after the primary path fails.
//!
//! Each service carries an ordered strategy list. When the primary call fails,
//! the selector walks the list once, returning the first strategy that
//! produces a value. Successful degraded results are wrapped in [`Degraded`]
//! so route handlers can surface provenance (cache, demo data, reduced scope)
//! without re-deriving it. If every strategy fails, the last encountered error
//! is rethrown; the selector never loops back.

use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::KeyValueStore;
use crate::ResilienceError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One degradation step in a service's fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Serve the cached value for the caller's cache key. Never fabricates
    /// data: no cached value means a distinct cache-unavailable error.
    CacheOnly,
    /// Serve a configured static payload after a small simulated latency.
    DemoData { payload: Option<Value> },
    /// Re-invoke the primary call (the caller degrades its own scope) and
    /// annotate the result with the disabled feature names.
    ReducedFunctionality { disabled_features: Vec<String> },
    /// Re-invoke the primary call, assumed to route to a different backend.
    AlternativeService { service: String },
    /// Hard stop with a configured user-facing message.
    ErrorResponse { message: String },
}

/// Where a returned value actually came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedBy {
    Primary,
    Cache,
    DemoData,
    ReducedFunctionality,
    AlternativeService(String),
}

/// A value plus its degradation provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Degraded<T> {
    pub value: T,
    pub served_by: ServedBy,
    /// Human-readable note when the value did not come from the primary path.
    pub warning: Option<String>,
}

impl<T> Degraded<T> {
    fn primary(value: T) -> Self {
        Self { value, served_by: ServedBy::Primary, warning: None }
    }

    /// True when the value came from the normal primary path.
    pub fn is_primary(&self) -> bool {
        self.served_by == ServedBy::Primary
    }
}

/// Walks per-service fallback chains. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FallbackSelector {
    strategies: Arc<HashMap<String, Vec<FallbackStrategy>>>,
    cache: Arc<dyn KeyValueStore>,
    sleeper: Arc<dyn Sleeper>,
    /// TTL used when write-through caching a successful primary value.
    cache_ttl: Option<Duration>,
    demo_latency: Duration,
}

impl FallbackSelector {
    pub fn new(cache: Arc<dyn KeyValueStore>) -> Self {
        Self {
            strategies: Arc::new(HashMap::new()),
            cache,
            sleeper: Arc::new(TokioSleeper),
            cache_ttl: Some(Duration::from_secs(60 * 60)),
            demo_latency: Duration::from_millis(200),
        }
    }

    pub fn with_strategies(mut self, strategies: HashMap<String, Vec<FallbackStrategy>>) -> Self {
        self.strategies = Arc::new(strategies);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// TTL for write-through caching of primary results; `None` disables the
    /// write-through entirely.
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_demo_latency(mut self, latency: Duration) -> Self {
        self.demo_latency = latency;
        self
    }

    /// Configured strategies for a service, in order.
    pub fn strategies_for(&self, service: &str) -> &[FallbackStrategy] {
        self.strategies.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run the primary call, degrading through the full configured chain on
    /// failure.
    pub async fn execute_with_fallback<T, E, Fut, Op>(
        &self,
        service: &str,
        cache_key: Option<&str>,
        op: Op,
    ) -> Result<Degraded<T>, ResilienceError<E>>
    where
        T: Serialize + DeserializeOwned + Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: Fn() -> Fut + Send + Sync,
    {
        self.execute_with_depth(service, cache_key, usize::MAX, op).await
    }

    /// Like [`Self::execute_with_fallback`] but walking at most `max_depth`
    /// strategies.
    pub async fn execute_with_depth<T, E, Fut, Op>(
        &self,
        service: &str,
        cache_key: Option<&str>,
        max_depth: usize,
        op: Op,
    ) -> Result<Degraded<T>, ResilienceError<E>>
    where
        T: Serialize + DeserializeOwned + Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: Fn() -> Fut + Send + Sync,
    {
        let mut last_err = match op().await {
            Ok(value) => {
                if let Some(key) = cache_key {
                    self.write_through(service, key, &value).await;
                }
                return Ok(Degraded::primary(value));
            }
            Err(e) => e,
        };

        let chain = self.strategies_for(service);
        if chain.is_empty() {
            return Err(last_err);
        }
        tracing::warn!(service, error = %last_err, "primary call failed, entering fallback chain");

        for strategy in chain.iter().take(max_depth) {
            match strategy {
                FallbackStrategy::CacheOnly => {
                    match self.read_cache::<T, E>(service, cache_key).await {
                        Ok(value) => {
                            tracing::info!(service, "fallback served from cache");
                            return Ok(Degraded {
                                value,
                                served_by: ServedBy::Cache,
                                warning: Some(
                                    "Serving cached results; fresh data is temporarily unavailable."
                                        .to_string(),
                                ),
                            });
                        }
                        Err(e) => last_err = e,
                    }
                }
                FallbackStrategy::DemoData { payload } => {
                    match payload.as_ref().and_then(|p| serde_json::from_value(p.clone()).ok()) {
                        Some(value) => {
                            self.sleeper.sleep(self.demo_latency).await;
                            tracing::info!(service, "fallback served demo data");
                            return Ok(Degraded {
                                value,
                                served_by: ServedBy::DemoData,
                                warning: Some(
                                    "Showing sample data while the service is unavailable."
                                        .to_string(),
                                ),
                            });
                        }
                        None => {
                            last_err = ResilienceError::Unavailable {
                                service: service.to_string(),
                                message: "demo data not configured".to_string(),
                            };
                        }
                    }
                }
                FallbackStrategy::ReducedFunctionality { disabled_features } => {
                    match op().await {
                        Ok(value) => {
                            tracing::info!(service, "fallback succeeded with reduced scope");
                            return Ok(Degraded {
                                value,
                                served_by: ServedBy::ReducedFunctionality,
                                warning: Some(format!(
                                    "Some features are temporarily disabled: {}.",
                                    disabled_features.join(", ")
                                )),
                            });
                        }
                        Err(e) => last_err = e,
                    }
                }
                FallbackStrategy::AlternativeService { service: alternate } => {
                    match op().await {
                        Ok(value) => {
                            tracing::info!(service, alternate = %alternate, "fallback served by alternative service");
                            return Ok(Degraded {
                                value,
                                served_by: ServedBy::AlternativeService(alternate.clone()),
                                warning: Some(format!("Served by backup provider '{}'.", alternate)),
                            });
                        }
                        Err(e) => last_err = e,
                    }
                }
                FallbackStrategy::ErrorResponse { message } => {
                    return Err(ResilienceError::Unavailable {
                        service: service.to_string(),
                        message: message.clone(),
                    });
                }
            }
        }

        tracing::error!(service, error = %last_err, "all fallback strategies exhausted");
        Err(last_err)
    }

    async fn read_cache<T: DeserializeOwned, E>(
        &self,
        service: &str,
        cache_key: Option<&str>,
    ) -> Result<T, ResilienceError<E>> {
        let miss = || ResilienceError::CacheUnavailable { service: service.to_string() };
        let key = cache_key.ok_or_else(miss)?;
        let raw = self.cache.get(key).await.map_err(|_| miss())?.ok_or_else(miss)?;
        serde_json::from_value(raw).map_err(|_| miss())
    }

    /// Best effort; a failed cache write never fails the primary result.
    async fn write_through<T: Serialize>(&self, service: &str, key: &str, value: &T) {
        let Some(ttl) = self.cache_ttl else { return };
        let Ok(raw) = serde_json::to_value(value) else { return };
        if let Err(e) = self.cache.set(key, raw, Some(ttl)).await {
            tracing::warn!(service, error = %e, "cache write-through failed");
        }
    }
}
