//! Fixed-interval background loops: auto-redrive, health evaluation and retention.
//!
//! Every loop re-reads the shared configuration on each tick, so intervals,
//! batch sizes and thresholds follow hot reloads without a restart.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::breaker::BreakerRegistry;
use crate::config::AppConfig;
use crate::error::StorageError;
use crate::health::{Alert, HealthService};
use crate::notify::{DiscordNotifier, MetricsSink};
use crate::queue::repository::{with_timeout, DlqRepository};
use crate::redrive::{AutoRedriveStats, RedriveEngine};

/// Remembers which alerts fired last time so only new ones are announced.
#[derive(Debug, Default)]
pub struct AlertTracker {
    active: HashSet<String>,
}

impl AlertTracker {
    /// Returns the alerts that were not firing at the previous evaluation.
    pub fn newly_firing(&mut self, alerts: &[Alert]) -> Vec<Alert> {
        let current: HashSet<String> = alerts.iter().map(|a| a.title.clone()).collect();
        let fresh = alerts
            .iter()
            .filter(|a| !self.active.contains(&a.title))
            .cloned()
            .collect();
        self.active = current;
        fresh
    }
}

/// Drives the periodic work of a running service.
pub struct Scheduler {
    config: Arc<RwLock<AppConfig>>,
    engine: Arc<RedriveEngine>,
    repository: Arc<dyn DlqRepository>,
    health: HealthService,
    metrics: Arc<dyn MetricsSink>,
    discord: Option<Arc<DiscordNotifier>>,
    alerts: Mutex<AlertTracker>,
}

impl Scheduler {
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        engine: Arc<RedriveEngine>,
        repository: Arc<dyn DlqRepository>,
        breakers: Arc<dyn BreakerRegistry>,
        metrics: Arc<dyn MetricsSink>,
        discord: Option<Arc<DiscordNotifier>>,
    ) -> Self {
        Self {
            health: HealthService::live(repository.clone(), breakers, config.clone()),
            config,
            engine,
            repository,
            metrics,
            discord,
            alerts: Mutex::new(AlertTracker::default()),
        }
    }

    /// Spawns the three loops. They stop once `shutdown` flips to true or its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().auto_redrive_loop(shutdown.clone())),
            tokio::spawn(self.clone().health_loop(shutdown.clone())),
            tokio::spawn(self.retention_loop(shutdown)),
        ]
    }

    async fn auto_redrive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting auto-redrive loop");
        loop {
            let (enabled, interval, batch_size) = {
                let config = self.config.read().await;
                let auto = &config.redrive.auto;
                (auto.enabled, auto.interval_seconds, auto.batch_size)
            };

            if enabled {
                if let Err(e) = self.run_auto_redrive_once(batch_size).await {
                    error!(error = %e, "Auto-redrive pass failed");
                }
            }

            if wait_or_shutdown(&mut shutdown, Duration::from_secs(interval.max(1))).await {
                break;
            }
        }
        info!("Auto-redrive loop stopped");
    }

    async fn health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting health evaluation loop");
        loop {
            if let Err(e) = self.run_health_once().await {
                error!(error = %e, "Health evaluation failed");
            }

            let interval = self.config.read().await.health.interval_seconds;
            if wait_or_shutdown(&mut shutdown, Duration::from_secs(interval.max(1))).await {
                break;
            }
        }
        info!("Health evaluation loop stopped");
    }

    async fn retention_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting retention loop");
        loop {
            let (enabled, interval) = {
                let config = self.config.read().await;
                (config.retention.enabled, config.retention.interval_seconds)
            };

            if enabled {
                if let Err(e) = self.run_retention_once().await {
                    error!(error = %e, "Retention cleanup failed");
                }
            }

            if wait_or_shutdown(&mut shutdown, Duration::from_secs(interval.max(1))).await {
                break;
            }
        }
        info!("Retention loop stopped");
    }

    /// One auto-redrive pass.
    pub async fn run_auto_redrive_once(
        &self,
        batch_size: usize,
    ) -> Result<AutoRedriveStats, StorageError> {
        self.engine.auto_redrive_pending(batch_size).await
    }

    /// Refreshes gauges and announces newly firing alerts. Returns every firing alert.
    pub async fn run_health_once(&self) -> Result<Vec<Alert>, StorageError> {
        let report = self.health.report().await?;
        self.metrics.observe_stats(&report.stats, report.health_score);

        let alerts = report.alerts;
        let fresh = self.alerts.lock().await.newly_firing(&alerts);

        debug!(
            health_score = report.health_score,
            total_entries = report.stats.total_entries,
            firing = alerts.len(),
            new = fresh.len(),
            "Health evaluated"
        );

        for alert in &fresh {
            warn!(
                severity = ?alert.severity,
                title = %alert.title,
                threshold = alert.metadata.threshold,
                current_value = alert.metadata.current_value,
                "{}",
                alert.message
            );
        }

        if let Some(discord) = &self.discord {
            if let Err(e) = discord.notify_alerts(&fresh).await {
                error!(error = %e, "Failed to deliver alerts to Discord");
            }
        }

        Ok(alerts)
    }

    /// Deletes entries past the retention period. Returns how many were removed.
    pub async fn run_retention_once(&self) -> Result<usize, StorageError> {
        let (days, status, timeout) = {
            let config = self.config.read().await;
            (
                config.retention.older_than_days,
                config.retention.status,
                storage_timeout(&config),
            )
        };

        let deleted = with_timeout(timeout, self.repository.cleanup(days, status)).await?;
        self.metrics.cleanup_performed(deleted);
        if deleted > 0 {
            info!(deleted, older_than_days = days, status = ?status, "Retention cleanup removed entries");
        }
        Ok(deleted)
    }
}

fn storage_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.global.storage.timeout_seconds.max(1))
}

/// Sleeps for `period`; returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerPolicy, LocalBreakerRegistry};
    use crate::health::{AlertMetadata, AlertSeverity};
    use crate::notify::NoopMetrics;
    use crate::queue::entry::{DlqEntry, DlqStatus};
    use crate::queue::InMemoryRepository;
    use crate::redrive::executor::MockTaskExecutor;
    use crate::redrive::BackoffPolicy;
    use chrono::{Duration as ChronoDuration, Utc};

    fn alert(title: &str) -> Alert {
        Alert {
            severity: AlertSeverity::Warning,
            title: title.to_string(),
            message: String::new(),
            metadata: AlertMetadata {
                threshold: 0.0,
                current_value: 1.0,
            },
        }
    }

    fn scheduler(repo: Arc<InMemoryRepository>) -> Scheduler {
        let breakers: Arc<dyn BreakerRegistry> =
            Arc::new(LocalBreakerRegistry::new(BreakerPolicy::default()));
        let engine = Arc::new(RedriveEngine::new(
            repo.clone(),
            breakers.clone(),
            Arc::new(MockTaskExecutor::new()),
            Arc::new(NoopMetrics),
            BackoffPolicy::default(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        Scheduler::new(
            Arc::new(RwLock::new(AppConfig::default())),
            engine,
            repo,
            breakers,
            Arc::new(NoopMetrics),
            None,
        )
    }

    #[test]
    fn test_alerts_are_announced_once_until_cleared() {
        let mut tracker = AlertTracker::default();

        let first = tracker.newly_firing(&[alert("Stale DLQ entries")]);
        assert_eq!(first.len(), 1);

        let again = tracker.newly_firing(&[alert("Stale DLQ entries"), alert("Critical DLQ entries")]);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].title, "Critical DLQ entries");

        assert!(tracker.newly_firing(&[]).is_empty());
        assert_eq!(tracker.newly_firing(&[alert("Stale DLQ entries")]).len(), 1);
    }

    #[tokio::test]
    async fn test_retention_removes_old_completed_entries() {
        let repo = Arc::new(InMemoryRepository::new());

        let mut old = DlqEntry::new("t-old", "export_csv", "Error", "boom");
        old.status = DlqStatus::Completed;
        old.created_at = Utc::now() - ChronoDuration::days(45);
        let mut old_pending = DlqEntry::new("t-pending", "export_csv", "Error", "boom");
        old_pending.created_at = Utc::now() - ChronoDuration::days(45);
        let fresh = DlqEntry::new("t-new", "export_csv", "Error", "boom");

        for e in [&old, &old_pending, &fresh] {
            repo.create(e).await.unwrap();
        }

        let deleted = scheduler(repo.clone()).run_retention_once().await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.len().await, 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops() {
        let repo = Arc::new(InMemoryRepository::new());
        let scheduler = Arc::new(scheduler(repo));
        let (tx, rx) = watch::channel(false);

        let handles = scheduler.spawn(rx);
        tx.send(true).unwrap();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
