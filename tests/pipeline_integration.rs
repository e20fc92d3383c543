//! Cross-module integration tests: retry, breaker, fallback, scheduler, and
//! cost accounting composed the way route handlers use them.

use attendry_resilience::{
    BackoffPolicy, BatchAggregator, BatchItem, BatchProvider, BatchProviderError, CallUsage,
    CircuitBreakerConfig, CircuitBreakerSet, CostTracker, EarlyStop, FallbackSelector,
    FallbackStrategy, HealthReporter, HealthStatus, InstantSleeper, ItemOrigin,
    MemoryCostRecordStore, MemoryKeyValueStore, MetricsStore, ParallelScheduler, ParallelTask,
    Pricing, PricingTable, ResilienceConfig, ResilienceError, RetryConfig, RetryExecutor,
    SchedulerConfig, TokenUsage, TrackingSleeper,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProviderDown(String);

impl fmt::Display for ProviderDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service unavailable: {}", self.0)
    }
}

impl std::error::Error for ProviderDown {}

fn demo_executor(metrics: Arc<MetricsStore>) -> RetryExecutor {
    let config = RetryConfig::with_backoff(
        2,
        BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(30),
            2.0,
            Duration::ZERO,
        )
        .unwrap(),
    );
    RetryExecutor::new(metrics)
        .with_configs(HashMap::from([("demo".to_string(), config)]))
}

#[tokio::test]
async fn fails_twice_then_succeeds_with_exact_delays() {
    let metrics = Arc::new(MetricsStore::default());
    let sleeper = TrackingSleeper::new();
    let executor = demo_executor(metrics.clone()).with_sleeper(sleeper.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let retried = executor
        .execute("demo", "flaky-op", move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderDown("warming up".into()))
                } else {
                    Ok("ready")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(retried.value, "ready");
    assert_eq!(retried.outcome.attempts, 3);
    // 100ms after the first failure, 200ms after the second
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
    assert_eq!(retried.outcome.total_delay, Duration::from_millis(300));
    assert!(retried.outcome.succeeded);

    let recorded = metrics.recent();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_degrade_to_demo_data() {
    let metrics = Arc::new(MetricsStore::default());
    let executor = demo_executor(metrics).with_sleeper(InstantSleeper);
    let selector = FallbackSelector::new(Arc::new(MemoryKeyValueStore::new()))
        .with_strategies(HashMap::from([(
            "demo".to_string(),
            vec![FallbackStrategy::DemoData { payload: Some(json!(["Sample Expo"])) }],
        )]))
        .with_sleeper(InstantSleeper);

    let degraded: attendry_resilience::Degraded<Vec<String>> = selector
        .execute_with_fallback("demo", None, || async {
            executor
                .execute("demo", "list-events", || async {
                    Err::<Vec<String>, _>(ProviderDown("hard down".into()))
                })
                .await
                .map(|retried| retried.value)
        })
        .await
        .unwrap();

    assert!(!degraded.is_primary());
    assert_eq!(degraded.value, vec!["Sample Expo".to_string()]);
    assert!(degraded.warning.is_some());
}

#[tokio::test]
async fn open_breaker_short_circuits_into_cached_results() {
    let breakers = CircuitBreakerSet::new(
        HashMap::from([(
            "search".to_string(),
            CircuitBreakerConfig::new(2, Duration::from_secs(60)).unwrap(),
        )]),
        CircuitBreakerConfig::default(),
    );
    let cache = Arc::new(MemoryKeyValueStore::new());
    let selector = FallbackSelector::new(cache.clone())
        .with_strategies(HashMap::from([(
            "search".to_string(),
            vec![FallbackStrategy::CacheOnly],
        )]))
        .with_sleeper(InstantSleeper);

    // Seed the cache from an earlier healthy call
    let warm: attendry_resilience::Degraded<Vec<String>> = selector
        .execute_with_fallback("search", Some("events:ber"), || {
            let breakers = breakers.clone();
            async move {
                breakers
                    .execute("search", || async { Ok::<_, ProviderDown>(vec!["Berlin Expo".to_string()]) })
                    .await
            }
        })
        .await
        .unwrap();
    assert!(warm.is_primary());

    // Trip the breaker
    for _ in 0..2 {
        let _ = breakers
            .execute("search", || async { Err::<(), _>(ProviderDown("boom".into())) })
            .await;
    }

    // The breaker now fails fast and the fallback serves the cached value
    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_clone = invoked.clone();
    let degraded: attendry_resilience::Degraded<Vec<String>> = selector
        .execute_with_fallback("search", Some("events:ber"), move || {
            let breakers = breakers.clone();
            let invoked = invoked_clone.clone();
            async move {
                breakers
                    .execute("search", || {
                        let invoked = invoked.clone();
                        async move {
                            invoked.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ProviderDown>(vec![])
                        }
                    })
                    .await
            }
        })
        .await
        .unwrap();

    assert_eq!(invoked.load(Ordering::SeqCst), 0, "open breaker must not invoke the operation");
    assert_eq!(degraded.value, vec!["Berlin Expo".to_string()]);
}

#[tokio::test]
async fn scheduler_runs_configured_services_with_partial_failures() {
    let config = ResilienceConfig::recommended();
    let metrics = Arc::new(MetricsStore::new(config.metrics_capacity()));
    let executor = RetryExecutor::new(metrics.clone())
        .with_configs(config.retry_configs().unwrap())
        .with_sleeper(InstantSleeper);
    let scheduler = ParallelScheduler::new(config.scheduler.clone(), executor).unwrap();

    let tasks: Vec<ParallelTask<usize>> = (0..8)
        .map(|i| {
            ParallelTask::new(format!("page-{}", i), "crawl", i)
                .with_priority(if i < 2 { 9.0 } else { 1.0 })
        })
        .collect();

    let reports = scheduler
        .process(
            tasks,
            |i: usize| async move {
                if i == 3 {
                    Err(ProviderDown("page gone".into()))
                } else {
                    Ok(format!("content-{}", i))
                }
            },
            None::<EarlyStop<String>>,
        )
        .await;

    assert_eq!(reports.len(), 8);
    assert_eq!(reports.iter().filter(|r| !r.succeeded).count(), 1);

    let run_metrics = scheduler.handle().metrics();
    assert_eq!(run_metrics.total_tasks, 8);
    assert_eq!(run_metrics.failed_tasks, 1);

    // The failed crawl shows up in the service's health
    let reporter = HealthReporter::new(metrics, CircuitBreakerSet::default());
    let health = reporter.service_health("crawl");
    assert!(health.error_rate > 0.0);
}

#[derive(Debug)]
struct OneShotProvider;

#[async_trait]
impl BatchProvider for OneShotProvider {
    async fn call(&self, _prompt: &str) -> Result<String, BatchProviderError> {
        Ok(r#"[{"id": "e0", "result": ["Grace Hopper"]}, {"id": "e1", "result": []}]"#.to_string())
    }
}

#[tokio::test]
async fn batched_extraction_is_costed_per_call() {
    let retry = RetryExecutor::new(Arc::new(MetricsStore::default())).with_sleeper(InstantSleeper);
    let aggregator = BatchAggregator::new(
        attendry_resilience::batch::SpeakerExtraction,
        Arc::new(OneShotProvider),
        retry,
        "llm",
    );
    let results = aggregator
        .process(vec![
            BatchItem::new("e0", "Keynote by Grace Hopper"),
            BatchItem::new("e1", "TBD"),
        ])
        .await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].value, vec!["Grace Hopper".to_string()]);
    assert_eq!(results[1].origin, ItemOrigin::Provider);

    // One combined call, one cost record
    let pricing = PricingTable::new()
        .with_service("llm", Pricing::PerToken { input_per_1k_usd: 0.003, output_per_1k_usd: 0.015 });
    let tracker = CostTracker::new(pricing, Arc::new(MemoryCostRecordStore::new()));
    tracker
        .track_call(
            CallUsage::new("llm").feature("speaker-extraction").tokens(TokenUsage::new(900, 120)),
        )
        .await
        .unwrap();
    let summary = tracker.summary(None, None).await.unwrap();
    assert_eq!(summary.total_calls, 1);
    assert!(summary.total_cost_usd > 0.0);
    assert_eq!(summary.by_feature["speaker-extraction"], summary.total_cost_usd);
}

#[tokio::test]
async fn unhealthy_service_is_visible_after_breaker_opens() {
    let metrics = Arc::new(MetricsStore::default());
    let breakers = CircuitBreakerSet::new(
        HashMap::from([(
            "llm".to_string(),
            CircuitBreakerConfig::new(1, Duration::from_secs(60)).unwrap(),
        )]),
        CircuitBreakerConfig::default(),
    );
    let _ = breakers
        .execute("llm", || async { Err::<(), _>(ProviderDown("model offline".into())) })
        .await;

    let reporter = HealthReporter::new(metrics, breakers);
    let all = reporter.all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].service, "llm");
    assert_eq!(all[0].status, HealthStatus::Unhealthy);

    // Scheduler config from the same preset stays within bounds
    let scheduler_config = SchedulerConfig::default();
    assert!(scheduler_config.validate().is_ok());
}

#[tokio::test]
async fn user_facing_message_never_echoes_provider_internals() {
    let metrics = Arc::new(MetricsStore::default());
    let executor = demo_executor(metrics).with_sleeper(InstantSleeper);

    let err = executor
        .execute("demo", "list", || async {
            Err::<(), _>(ProviderDown("ECONNREFUSED 10.1.2.3:443 key=sk-abc123".into()))
        })
        .await
        .unwrap_err();

    let message = attendry_resilience::map_error_for(&err);
    assert!(!message.message.contains("sk-abc123"));
    assert!(!message.message.contains("10.1.2.3"));
    match err {
        ResilienceError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected retry exhaustion, got {:?}", other),
    }
}
