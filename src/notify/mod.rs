//! Outbound signals: Prometheus metrics and Discord alerts.

pub mod discord;
pub mod prometheus;

use std::time::Duration;

use crate::breaker::TaskBucket;
use crate::queue::entry::DlqEntry;
use crate::queue::stats::DlqStats;

pub use discord::DiscordNotifier;
pub use prometheus::{MetricsServer, PrometheusMetrics};

/// Receives DLQ metric events.
///
/// Constructed once at startup and shared as `Arc<dyn MetricsSink>`.
pub trait MetricsSink: Send + Sync {
    /// A new entry was captured.
    fn entry_created(&self, entry: &DlqEntry);

    /// A dispatched redrive attempt finished. Requests rejected before dispatch are not reported.
    fn redrive_attempted(&self, bucket: TaskBucket, success: bool, duration: Duration);

    /// An entry reached a terminal status; records its age.
    fn entry_finished(&self, entry: &DlqEntry);

    /// A cleanup run deleted `deleted` entries.
    fn cleanup_performed(&self, deleted: usize);

    /// Refreshes gauges from a statistics snapshot.
    fn observe_stats(&self, stats: &DlqStats, health_score: f64);
}

/// Discards everything. Used by one-shot CLI commands and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn entry_created(&self, _entry: &DlqEntry) {}

    fn redrive_attempted(&self, _bucket: TaskBucket, _success: bool, _duration: Duration) {}

    fn entry_finished(&self, _entry: &DlqEntry) {}

    fn cleanup_performed(&self, _deleted: usize) {}

    fn observe_stats(&self, _stats: &DlqStats, _health_score: f64) {}
}
