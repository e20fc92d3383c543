//! Cost and usage accounting for billable external calls.
//!
//! Each billable call produces one immutable [`CostRecord`], priced from a
//! per-service [`PricingTable`] (flat per-call or token-tiered, never both).
//! Cache hits are charged zero, with the would-be cost recorded as savings.
//! Summaries are computed on demand from the record store; budget checks are
//! advisory and never block the call that triggered them.

use crate::clock::{Clock, SystemClock};
use crate::store::{CostQuery, CostRecordStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const DAY_MILLIS: u64 = 24 * 60 * 60 * 1_000;
const MONTH_MILLIS: u64 = 30 * DAY_MILLIS;

/// Token counts for one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self { input_tokens, output_tokens }
    }
}

/// How one service is billed. The enum makes flat and token-tiered pricing
/// mutually exclusive per service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pricing {
    /// Fixed cost per call, regardless of payload size.
    FlatPerCall { usd: f64 },
    /// Cost per 1K input/output tokens.
    PerToken { input_per_1k_usd: f64, output_per_1k_usd: f64 },
}

impl Pricing {
    /// Cost in USD for one call with the given token counts.
    ///
    /// Token-tiered pricing with no token counts reported charges zero; the
    /// caller is expected to report usage for token-billed services.
    pub fn cost(&self, tokens: Option<TokenUsage>) -> f64 {
        match self {
            Pricing::FlatPerCall { usd } => *usd,
            Pricing::PerToken { input_per_1k_usd, output_per_1k_usd } => match tokens {
                Some(t) => {
                    (t.input_tokens as f64 / 1_000.0) * input_per_1k_usd
                        + (t.output_tokens as f64 / 1_000.0) * output_per_1k_usd
                }
                None => 0.0,
            },
        }
    }
}

/// Per-service pricing. Unknown services cost zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    services: HashMap<String, Pricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>, pricing: Pricing) -> Self {
        self.services.insert(service.into(), pricing);
        self
    }

    pub fn get(&self, service: &str) -> Option<&Pricing> {
        self.services.get(service)
    }

    /// Cost of one call to `service`; zero when the service has no pricing entry.
    pub fn cost_of(&self, service: &str, tokens: Option<TokenUsage>) -> f64 {
        self.services.get(service).map(|p| p.cost(tokens)).unwrap_or(0.0)
    }
}

/// One billable external call. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub user_id: Option<String>,
    pub service: String,
    pub feature: Option<String>,
    /// Amount actually charged; zero for cache hits.
    pub cost_usd: f64,
    pub tokens_used: Option<TokenUsage>,
    pub api_call_count: usize,
    pub cache_hit: bool,
    /// Cost that would have applied had the call not been served from cache.
    pub cache_savings_usd: f64,
    pub metadata: Value,
    /// Epoch milliseconds.
    pub timestamp_millis: u64,
}

/// Description of a call to be priced and recorded.
#[derive(Debug, Clone)]
pub struct CallUsage {
    service: String,
    user_id: Option<String>,
    feature: Option<String>,
    tokens: Option<TokenUsage>,
    cache_hit: bool,
    metadata: Value,
}

impl CallUsage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user_id: None,
            feature: None,
            tokens: None,
            cache_hit: false,
            metadata: Value::Null,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Aggregate cost view, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_calls: usize,
    pub cache_hits: usize,
    pub cache_savings_usd: f64,
    /// Fraction of calls served from cache.
    pub cache_hit_rate: f64,
    pub by_service: BTreeMap<String, f64>,
    pub by_feature: BTreeMap<String, f64>,
}

/// Spending limits per rolling window. Alerts fire past `alert_threshold`
/// of a limit; they are advisory and never block calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_limit_usd: Option<f64>,
    pub monthly_limit_usd: Option<f64>,
    /// Fraction of a limit at which an alert fires.
    pub alert_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { daily_limit_usd: None, monthly_limit_usd: None, alert_threshold: 0.8 }
    }
}

/// Rolling budget window: last 24 hours or last 30 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BudgetWindow {
    Daily,
    Monthly,
}

impl BudgetWindow {
    fn span_millis(self) -> u64 {
        match self {
            BudgetWindow::Daily => DAY_MILLIS,
            BudgetWindow::Monthly => MONTH_MILLIS,
        }
    }
}

/// Advisory notice that spend crossed the alert threshold of a limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    pub window: BudgetWindow,
    pub user_id: Option<String>,
    pub spent_usd: f64,
    pub limit_usd: f64,
    /// `spent_usd / limit_usd`.
    pub consumed: f64,
}

/// Prices calls, persists records, and evaluates advisory budgets.
#[derive(Debug, Clone)]
pub struct CostTracker {
    pricing: PricingTable,
    budget: BudgetConfig,
    store: Arc<dyn CostRecordStore>,
    clock: Arc<dyn Clock>,
}

impl CostTracker {
    pub fn new(pricing: PricingTable, store: Arc<dyn CostRecordStore>) -> Self {
        Self { pricing, budget: BudgetConfig::default(), store, clock: Arc::new(SystemClock) }
    }

    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Price and persist one call, returning the stored record.
    ///
    /// A cache hit is charged zero; the would-be cost lands in
    /// `cache_savings_usd` so savings remain visible in summaries.
    pub async fn track_call(&self, usage: CallUsage) -> Result<CostRecord, StoreError> {
        let would_be = self.pricing.cost_of(&usage.service, usage.tokens);
        let (cost_usd, cache_savings_usd) =
            if usage.cache_hit { (0.0, would_be) } else { (would_be, 0.0) };

        let record = CostRecord {
            user_id: usage.user_id,
            service: usage.service,
            feature: usage.feature,
            cost_usd,
            tokens_used: usage.tokens,
            api_call_count: 1,
            cache_hit: usage.cache_hit,
            cache_savings_usd,
            metadata: usage.metadata,
            timestamp_millis: self.clock.now_millis(),
        };
        tracing::debug!(
            service = %record.service,
            cost_usd = record.cost_usd,
            cache_hit = record.cache_hit,
            "tracked billable call"
        );
        self.store.insert(record.clone()).await?;
        Ok(record)
    }

    /// Aggregate spend, optionally scoped to a user and/or an epoch-millis
    /// range `[since, until)`.
    pub async fn summary(
        &self,
        user_id: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Result<CostSummary, StoreError> {
        let filter = CostQuery {
            user_id: user_id.map(str::to_string),
            service: None,
            since_millis: range.map(|(since, _)| since),
            until_millis: range.map(|(_, until)| until),
        };
        let records = self.store.query(&filter).await?;

        let mut summary = CostSummary {
            total_cost_usd: 0.0,
            total_calls: 0,
            cache_hits: 0,
            cache_savings_usd: 0.0,
            cache_hit_rate: 0.0,
            by_service: BTreeMap::new(),
            by_feature: BTreeMap::new(),
        };
        for record in &records {
            summary.total_cost_usd += record.cost_usd;
            summary.total_calls += record.api_call_count;
            if record.cache_hit {
                summary.cache_hits += 1;
            }
            summary.cache_savings_usd += record.cache_savings_usd;
            *summary.by_service.entry(record.service.clone()).or_insert(0.0) += record.cost_usd;
            if let Some(feature) = &record.feature {
                *summary.by_feature.entry(feature.clone()).or_insert(0.0) += record.cost_usd;
            }
        }
        if summary.total_calls > 0 {
            summary.cache_hit_rate = summary.cache_hits as f64 / summary.total_calls as f64;
        }
        Ok(summary)
    }

    /// Evaluate configured budgets for a user (or globally with `None`).
    ///
    /// Returns at most one alert per configured window. Advisory only.
    pub async fn check_budget(&self, user_id: Option<&str>) -> Result<Vec<BudgetAlert>, StoreError> {
        let mut alerts = Vec::new();
        let windows = [
            (BudgetWindow::Daily, self.budget.daily_limit_usd),
            (BudgetWindow::Monthly, self.budget.monthly_limit_usd),
        ];
        let now = self.clock.now_millis();

        for (window, limit) in windows {
            let Some(limit_usd) = limit else { continue };
            if limit_usd <= 0.0 {
                continue;
            }
            let since = now.saturating_sub(window.span_millis());
            let spent_usd =
                self.summary(user_id, Some((since, now.saturating_add(1)))).await?.total_cost_usd;
            let consumed = spent_usd / limit_usd;
            if consumed >= self.budget.alert_threshold {
                tracing::warn!(
                    window = ?window,
                    user = user_id.unwrap_or("<global>"),
                    spent_usd,
                    limit_usd,
                    "budget threshold crossed"
                );
                alerts.push(BudgetAlert {
                    window,
                    user_id: user_id.map(str::to_string),
                    spent_usd,
                    limit_usd,
                    consumed,
                });
            }
        }
        Ok(alerts)
    }
}
