//! Health report combining statistics, score, alerts and breaker state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{evaluate_alert_rules, health_score, Alert, AlertRules};
use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::config::AppConfig;
use crate::error::StorageError;
use crate::queue::repository::{with_timeout, DlqRepository};
use crate::queue::stats::DlqStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Buckets a score: 90+ healthy, 70+ degraded, below that unhealthy.
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            HealthStatus::Healthy
        } else if score >= 70.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub health_score: f64,
    pub status: HealthStatus,
    pub stats: DlqStats,
    pub alerts: Vec<Alert>,
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub generated_at: DateTime<Utc>,
}

/// Where a [`HealthService`] takes its thresholds from.
enum Settings {
    Fixed {
        rules: AlertRules,
        window_days: u32,
        storage_timeout: Duration,
    },
    /// Read per report, so hot-reloaded thresholds apply immediately.
    Live(Arc<RwLock<AppConfig>>),
}

/// Builds health reports on demand.
pub struct HealthService {
    repository: Arc<dyn DlqRepository>,
    breakers: Arc<dyn BreakerRegistry>,
    settings: Settings,
}

impl HealthService {
    pub fn new(
        repository: Arc<dyn DlqRepository>,
        breakers: Arc<dyn BreakerRegistry>,
        rules: AlertRules,
        window_days: u32,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            breakers,
            settings: Settings::Fixed {
                rules,
                window_days,
                storage_timeout,
            },
        }
    }

    /// A service that follows the shared, hot-reloaded configuration.
    pub fn live(
        repository: Arc<dyn DlqRepository>,
        breakers: Arc<dyn BreakerRegistry>,
        config: Arc<RwLock<AppConfig>>,
    ) -> Self {
        Self {
            repository,
            breakers,
            settings: Settings::Live(config),
        }
    }

    async fn current_settings(&self) -> (AlertRules, u32, Duration) {
        match &self.settings {
            Settings::Fixed {
                rules,
                window_days,
                storage_timeout,
            } => (rules.clone(), *window_days, *storage_timeout),
            Settings::Live(config) => {
                let config = config.read().await;
                (
                    config.health.alerts.clone(),
                    config.health.stats_window_days,
                    Duration::from_secs(config.global.storage.timeout_seconds.max(1)),
                )
            }
        }
    }

    pub async fn report(&self) -> Result<HealthReport, StorageError> {
        let (rules, window_days, timeout) = self.current_settings().await;
        let stats = with_timeout(timeout, self.repository.stats(window_days)).await?;
        let circuit_breakers = with_timeout(timeout, self.breakers.snapshot()).await?;
        Ok(Self::build(stats, circuit_breakers, &rules))
    }

    /// Assembles a report from already-fetched parts.
    pub fn build(
        stats: DlqStats,
        circuit_breakers: Vec<BreakerSnapshot>,
        rules: &AlertRules,
    ) -> HealthReport {
        let score = health_score(&stats);
        HealthReport {
            health_score: score,
            status: HealthStatus::from_score(score),
            alerts: evaluate_alert_rules(&stats, rules),
            stats,
            circuit_breakers,
            generated_at: Utc::now(),
        }
    }
}
