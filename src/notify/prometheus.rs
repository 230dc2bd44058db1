//! Prometheus metrics exporter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry,
};
use tracing::{error, info, warn};

use super::MetricsSink;
use crate::breaker::TaskBucket;
use crate::error::NotificationError;
use crate::health::HealthService;
use crate::queue::entry::{DlqEntry, DlqPriority, DlqStatus, ErrorCategory};
use crate::queue::stats::DlqStats;

/// Prometheus metrics for the DLQ.
pub struct PrometheusMetrics {
    registry: Registry,
    /// Captured entries by category and priority.
    entries_created_total: IntCounterVec,
    /// Redrive attempts by bucket and result.
    redrive_attempts_total: IntCounterVec,
    cleanup_operations_total: IntCounter,
    cleanup_deleted_total: IntCounter,
    entries: GaugeVec,
    entries_by_category: GaugeVec,
    entries_by_priority: GaugeVec,
    health_score: Gauge,
    oldest_entry_age_hours: Gauge,
    pending_entries: Gauge,
    entry_age_hours: Histogram,
    redrive_duration_seconds: HistogramVec,
}

fn prom_err(e: prometheus::Error) -> NotificationError {
    NotificationError::PrometheusFailed(e.to_string())
}

impl PrometheusMetrics {
    /// Creates and registers every DLQ metric.
    pub fn new() -> Result<Self, NotificationError> {
        let registry = Registry::new();

        let entries_created_total = IntCounterVec::new(
            Opts::new("dlq_entries_created_total", "Total DLQ entries captured"),
            &["category", "priority"],
        )
        .map_err(prom_err)?;

        let redrive_attempts_total = IntCounterVec::new(
            Opts::new("dlq_redrive_attempts_total", "Total redrive attempts"),
            &["bucket", "result"],
        )
        .map_err(prom_err)?;

        let cleanup_operations_total = IntCounter::new(
            "dlq_cleanup_operations_total",
            "Number of cleanup runs",
        )
        .map_err(prom_err)?;

        let cleanup_deleted_total = IntCounter::new(
            "dlq_cleanup_deleted_total",
            "Entries deleted by cleanup runs",
        )
        .map_err(prom_err)?;

        let entries = GaugeVec::new(
            Opts::new("dlq_entries", "DLQ entries in the stats window by status"),
            &["status"],
        )
        .map_err(prom_err)?;

        let entries_by_category = GaugeVec::new(
            Opts::new("dlq_entries_by_category", "DLQ entries by error category"),
            &["category"],
        )
        .map_err(prom_err)?;

        let entries_by_priority = GaugeVec::new(
            Opts::new("dlq_entries_by_priority", "DLQ entries by priority"),
            &["priority"],
        )
        .map_err(prom_err)?;

        let health_score =
            Gauge::new("dlq_health_score", "DLQ health score (0-100)").map_err(prom_err)?;

        let oldest_entry_age_hours = Gauge::new(
            "dlq_oldest_entry_age_hours",
            "Age of the oldest entry in hours",
        )
        .map_err(prom_err)?;

        let pending_entries =
            Gauge::new("dlq_pending_entries", "Entries waiting for redrive").map_err(prom_err)?;

        let entry_age_hours = Histogram::with_opts(
            HistogramOpts::new(
                "dlq_entry_age_hours",
                "Age of entries when they reach a terminal status",
            )
            .buckets(vec![0.1, 0.5, 1.0, 4.0, 12.0, 24.0, 72.0, 168.0]),
        )
        .map_err(prom_err)?;

        let redrive_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dlq_redrive_duration_seconds",
                "Time taken by redrive attempts",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["bucket"],
        )
        .map_err(prom_err)?;

        registry
            .register(Box::new(entries_created_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(redrive_attempts_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(cleanup_operations_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(cleanup_deleted_total.clone()))
            .map_err(prom_err)?;
        registry.register(Box::new(entries.clone())).map_err(prom_err)?;
        registry
            .register(Box::new(entries_by_category.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(entries_by_priority.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(health_score.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(oldest_entry_age_hours.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(pending_entries.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(entry_age_hours.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(redrive_duration_seconds.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            entries_created_total,
            redrive_attempts_total,
            cleanup_operations_total,
            cleanup_deleted_total,
            entries,
            entries_by_category,
            entries_by_priority,
            health_score,
            oldest_entry_age_hours,
            pending_entries,
            entry_age_hours,
            redrive_duration_seconds,
        })
    }

    /// Returns the metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String, NotificationError> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| NotificationError::PrometheusFailed(e.to_string()))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn entry_created(&self, entry: &DlqEntry) {
        self.entries_created_total
            .with_label_values(&[entry.error_category.as_str(), entry.priority.as_str()])
            .inc();
    }

    fn redrive_attempted(&self, bucket: TaskBucket, success: bool, duration: Duration) {
        let result = if success { "success" } else { "failure" };
        self.redrive_attempts_total
            .with_label_values(&[bucket.as_str(), result])
            .inc();
        self.redrive_duration_seconds
            .with_label_values(&[bucket.as_str()])
            .observe(duration.as_secs_f64());
    }

    fn entry_finished(&self, entry: &DlqEntry) {
        self.entry_age_hours.observe(entry.age_hours(Utc::now()));
    }

    fn cleanup_performed(&self, deleted: usize) {
        self.cleanup_operations_total.inc();
        self.cleanup_deleted_total.inc_by(deleted as u64);
    }

    fn observe_stats(&self, stats: &DlqStats, health_score: f64) {
        for status in DlqStatus::ALL {
            self.entries
                .with_label_values(&[status.as_str()])
                .set(stats.status_count(status) as f64);
        }
        for category in ErrorCategory::ALL {
            self.entries_by_category
                .with_label_values(&[category.as_str()])
                .set(stats.category_count(category) as f64);
        }
        for priority in DlqPriority::ALL {
            self.entries_by_priority
                .with_label_values(&[priority.as_str()])
                .set(stats.priority_count(priority) as f64);
        }
        self.health_score.set(health_score);
        self.oldest_entry_age_hours.set(stats.oldest_entry_age_hours);
        self.pending_entries.set(stats.pending() as f64);
    }
}

/// HTTP server for `/metrics` and `/health`.
pub struct MetricsServer {
    metrics: Arc<PrometheusMetrics>,
    health: Arc<HealthService>,
    port: u16,
}

impl MetricsServer {
    pub fn new(metrics: Arc<PrometheusMetrics>, health: Arc<HealthService>, port: u16) -> Self {
        Self {
            metrics,
            health,
            port,
        }
    }

    /// Starts the HTTP server. Runs until the task is dropped or accept fails.
    pub async fn start(self) -> Result<(), NotificationError> {
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{body::Incoming, Request};
        use hyper_util::rt::TokioIo;

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

        info!(port = self.port, "Starting metrics and health server");

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();
            let health = self.health.clone();

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    let health = health.clone();
                    async move {
                        Ok::<_, hyper::Error>(route(req.uri().path(), &metrics, &health).await)
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving connection");
                }
            });
        }
    }
}

type Body = http_body_util::Full<hyper::body::Bytes>;

async fn route(
    path: &str,
    metrics: &PrometheusMetrics,
    health: &HealthService,
) -> hyper::Response<Body> {
    match path {
        "/metrics" => match metrics.gather() {
            Ok(text) => respond(200, "text/plain; version=0.0.4", text),
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                respond(500, "text/plain", e.to_string())
            }
        },
        "/health" => match health.report().await {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(json) => respond(200, "application/json", json),
                Err(e) => respond(500, "text/plain", e.to_string()),
            },
            Err(e) => {
                warn!(error = %e, "Health report unavailable");
                respond(
                    503,
                    "application/json",
                    serde_json::json!({ "status": "unavailable", "error": e.to_string() })
                        .to_string(),
                )
            }
        },
        _ => respond(404, "text/plain", "Not Found".to_string()),
    }
}

fn respond(status: u16, content_type: &str, body: String) -> hyper::Response<Body> {
    let mut response = hyper::Response::new(Body::from(body));
    *response.status_mut() =
        hyper::StatusCode::from_u16(status).unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::entry::DlqEntry;

    #[test]
    fn test_gather_exposes_recorded_metrics() {
        let metrics = PrometheusMetrics::new().unwrap();

        let mut entry = DlqEntry::new("t-1", "export_csv", "ConnectionError", "refused");
        entry.error_category = ErrorCategory::Network;
        entry.priority = DlqPriority::High;
        metrics.entry_created(&entry);
        metrics.redrive_attempted(TaskBucket::Export, true, Duration::from_millis(250));
        metrics.cleanup_performed(4);

        let text = metrics.gather().unwrap();
        assert!(text.contains(
            "dlq_entries_created_total{category=\"network\",priority=\"high\"} 1"
        ));
        assert!(text.contains("dlq_redrive_attempts_total{bucket=\"export\",result=\"success\"} 1"));
        assert!(text.contains("dlq_cleanup_deleted_total 4"));
    }

    #[test]
    fn test_observe_stats_sets_gauges() {
        let metrics = PrometheusMetrics::new().unwrap();
        let stats = DlqStats {
            window_days: 1,
            total_entries: 3,
            by_status: [(DlqStatus::Pending, 2), (DlqStatus::Completed, 1)]
                .into_iter()
                .collect(),
            oldest_entry_age_hours: 5.0,
            ..Default::default()
        };

        metrics.observe_stats(&stats, 80.0);

        let text = metrics.gather().unwrap();
        assert!(text.contains("dlq_pending_entries 2"));
        assert!(text.contains("dlq_health_score 80"));
        assert!(text.contains("dlq_entries{status=\"completed\"} 1"));
    }
}
