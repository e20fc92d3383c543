//! Per-service health read model.
//!
//! Combines recent retry outcomes (from the [`MetricsStore`]) with circuit
//! breaker state into a queryable `{status, rates, issues, recommendations}`
//! snapshot. This is a pull-based read model for dashboards and status
//! endpoints, not an event stream; nothing here mutates resilience state.

use crate::circuit_breaker::{CircuitBreakerSet, CircuitState};
use crate::metrics::MetricsStore;
use serde::Serialize;
use std::sync::Arc;

/// Overall health verdict for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Queryable health snapshot for one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    /// Fraction of recent retry sequences that ended in failure.
    pub error_rate: f64,
    /// Fraction of recent retry sequences that needed more than one attempt.
    pub retry_rate: f64,
    pub circuit_state: CircuitState,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Rate thresholds for the health verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Error rate at or above this is degraded.
    pub degraded_error_rate: f64,
    /// Error rate at or above this is unhealthy.
    pub unhealthy_error_rate: f64,
    /// Retry rate at or above this is degraded.
    pub degraded_retry_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self { degraded_error_rate: 0.1, unhealthy_error_rate: 0.5, degraded_retry_rate: 0.3 }
    }
}

/// Builds [`ServiceHealth`] snapshots from shared metrics and breaker state.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    metrics: Arc<MetricsStore>,
    breakers: CircuitBreakerSet,
    thresholds: HealthThresholds,
}

impl HealthReporter {
    pub fn new(metrics: Arc<MetricsStore>, breakers: CircuitBreakerSet) -> Self {
        Self { metrics, breakers, thresholds: HealthThresholds::default() }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Health snapshot for one service. Services with no recorded activity
    /// and a closed breaker read as healthy.
    pub fn service_health(&self, service: &str) -> ServiceHealth {
        let stats = self.metrics.service_stats(service);
        let circuit_state = self.breakers.state(service);
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        let mut status = HealthStatus::Healthy;

        match circuit_state {
            CircuitState::Open => {
                status = HealthStatus::Unhealthy;
                issues.push("circuit breaker is open; calls are being short-circuited".to_string());
                recommendations
                    .push("wait for the cool-down or investigate the dependency".to_string());
            }
            CircuitState::HalfOpen => {
                status = HealthStatus::Degraded;
                issues.push("circuit breaker is probing recovery".to_string());
                recommendations.push("expect reduced throughput until the probe settles".to_string());
            }
            CircuitState::Closed => {}
        }

        if stats.total > 0 {
            if stats.error_rate >= self.thresholds.unhealthy_error_rate {
                status = HealthStatus::Unhealthy;
                issues.push(format!(
                    "error rate {:.0}% over the last {} calls",
                    stats.error_rate * 100.0,
                    stats.total
                ));
                recommendations.push("check provider status and credentials".to_string());
            } else if stats.error_rate >= self.thresholds.degraded_error_rate {
                status = status.max_severity(HealthStatus::Degraded);
                issues.push(format!("elevated error rate {:.0}%", stats.error_rate * 100.0));
                recommendations.push("monitor closely; consider enabling fallbacks".to_string());
            }

            if stats.retry_rate >= self.thresholds.degraded_retry_rate {
                status = status.max_severity(HealthStatus::Degraded);
                issues.push(format!(
                    "{:.0}% of calls needed retries",
                    stats.retry_rate * 100.0
                ));
                recommendations
                    .push("increase backoff or review provider rate limits".to_string());
            }
        }

        ServiceHealth {
            service: service.to_string(),
            status,
            error_rate: stats.error_rate,
            retry_rate: stats.retry_rate,
            circuit_state,
            issues,
            recommendations,
        }
    }

    /// Snapshots for every service known to the metrics buffer or the breaker
    /// set, sorted by name.
    pub fn all(&self) -> Vec<ServiceHealth> {
        let mut names = self.metrics.services();
        for (name, _) in self.breakers.snapshot() {
            names.push(name);
        }
        names.sort();
        names.dedup();
        names.iter().map(|name| self.service_health(name)).collect()
    }
}

impl HealthStatus {
    /// The more severe of two statuses.
    fn max_severity(self, other: HealthStatus) -> HealthStatus {
        fn rank(status: HealthStatus) -> u8 {
            match status {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}
