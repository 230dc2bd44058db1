//! Failure capture: classification, redaction and persistence of failed tasks.

pub mod classifier;
pub mod listener;
pub mod redact;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

pub use classifier::ErrorClassifier;
pub use listener::FailureListener;
pub use redact::Redactor;

use crate::error::StorageError;
use crate::notify::MetricsSink;
use crate::queue::entry::DlqEntry;
use crate::queue::repository::{with_timeout, DlqRepository};

/// A task failure as reported by the execution engine's failure hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSignal {
    pub task_id: String,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Business entity the task worked on, e.g. an invoice id.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub execution_time_seconds: Option<f64>,
    /// Overrides the configured retry budget for this task.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Engine diagnostics, kept on the entry after redaction.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Records task failures in the DLQ.
///
/// Capture never fails the caller: errors are logged and swallowed so they
/// cannot mask the original task failure.
pub struct DlqCapture {
    repository: Arc<dyn DlqRepository>,
    classifier: ErrorClassifier,
    redactor: Redactor,
    metrics: Arc<dyn MetricsSink>,
    default_max_retries: u32,
    storage_timeout: Duration,
}

impl DlqCapture {
    pub fn new(
        repository: Arc<dyn DlqRepository>,
        classifier: ErrorClassifier,
        redactor: Redactor,
        metrics: Arc<dyn MetricsSink>,
        default_max_retries: u32,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            classifier,
            redactor,
            metrics,
            default_max_retries,
            storage_timeout,
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Captures a failure, returning the stored entry when capture succeeded.
    pub async fn capture(&self, signal: FailureSignal) -> Option<DlqEntry> {
        let task_id = signal.task_id.clone();
        let task_name = signal.task_name.clone();

        match self.try_capture(signal).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    task_id = %task_id,
                    task_name = %task_name,
                    error = %e,
                    "Failed to capture task failure in DLQ"
                );
                None
            }
        }
    }

    /// Captures a failure, reporting storage errors instead of logging them.
    ///
    /// `Ok(None)` means the task is excluded from capture.
    pub async fn try_capture(&self, signal: FailureSignal) -> Result<Option<DlqEntry>, StorageError> {
        if !self.classifier.should_capture(&signal.task_name) {
            debug!(task_name = %signal.task_name, "Skipping capture of internal task");
            return Ok(None);
        }
        self.store(signal).await.map(Some)
    }

    async fn store(&self, signal: FailureSignal) -> Result<DlqEntry, StorageError> {
        let existing = with_timeout(
            self.storage_timeout,
            self.repository.get_by_task_id(&signal.task_id),
        )
        .await?;

        if let Some(entry) = existing {
            return self.refresh(entry, &signal).await;
        }

        let entry = self.build_entry(signal);
        match with_timeout(self.storage_timeout, self.repository.create(&entry)).await {
            Ok(()) => {
                info!(
                    entry_id = %entry.id,
                    task_id = %entry.task_id,
                    task_name = %entry.task_name,
                    category = %entry.error_category,
                    priority = %entry.priority,
                    "Captured task failure"
                );
                self.metrics.entry_created(&entry);
                Ok(entry)
            }
            // Another capture of the same task won the race; fold into it.
            Err(StorageError::DuplicateTaskId { .. }) => {
                let stored = with_timeout(
                    self.storage_timeout,
                    self.repository.get_by_task_id(&entry.task_id),
                )
                .await?
                .ok_or_else(|| StorageError::NotFound {
                    id: entry.task_id.clone(),
                })?;
                self.refresh_from_entry(stored, &entry).await
            }
            Err(e) => Err(e),
        }
    }

    fn build_entry(&self, signal: FailureSignal) -> DlqEntry {
        let category = self
            .classifier
            .classify(&signal.error_type, &signal.error_message);
        let priority = self.classifier.determine_priority(
            category,
            &signal.task_name,
            signal.correlation_id.as_deref(),
        );
        let idempotency_key = signal
            .idempotency_key
            .clone()
            .unwrap_or_else(|| derive_idempotency_key(&signal.task_name, &signal.args, &signal.kwargs));

        let mut entry = DlqEntry::new(
            signal.task_id,
            signal.task_name,
            signal.error_type,
            self.redactor.redact_text(&signal.error_message),
        );
        entry.task_args = signal.args;
        entry.task_kwargs = signal.kwargs;
        entry.original_metadata = self.redactor.redact_map(&signal.metadata);
        entry.stack_trace = signal.stack_trace.map(|t| self.redactor.redact_text(&t));
        entry.error_category = category;
        entry.priority = priority;
        entry.max_retries = signal.max_retries.unwrap_or(self.default_max_retries);
        entry.idempotency_key = Some(idempotency_key);
        entry.correlated_entity_id = signal.correlation_id;
        entry.worker_name = signal.worker_name;
        entry.queue_name = signal.queue_name;
        entry.execution_time_seconds = signal.execution_time_seconds;
        entry
    }

    async fn refresh(
        &self,
        existing: DlqEntry,
        signal: &FailureSignal,
    ) -> Result<DlqEntry, StorageError> {
        let incoming = self.build_entry(signal.clone());
        self.refresh_from_entry(existing, &incoming).await
    }

    /// Updates a stored entry with the error details of a repeated failure signal.
    ///
    /// The write only lands on the version that was read, so a redrive that
    /// moves the entry in between is never rolled back.
    async fn refresh_from_entry(
        &self,
        mut stored: DlqEntry,
        incoming: &DlqEntry,
    ) -> Result<DlqEntry, StorageError> {
        for _ in 0..REFRESH_ATTEMPTS {
            let refreshed = with_repeated_failure(&stored, incoming);
            let written = with_timeout(
                self.storage_timeout,
                self.repository.update_if_unchanged(&refreshed, &stored),
            )
            .await?;
            if written {
                debug!(
                    entry_id = %refreshed.id,
                    task_id = %refreshed.task_id,
                    status = %refreshed.status,
                    "Refreshed existing DLQ entry for repeated failure"
                );
                return Ok(refreshed);
            }

            debug!(entry_id = %stored.id, "Entry changed during refresh, re-reading");
            stored = with_timeout(self.storage_timeout, self.repository.get_by_id(&stored.id))
                .await?
                .ok_or_else(|| StorageError::NotFound {
                    id: stored.id.clone(),
                })?;
        }

        Err(StorageError::Contention {
            key: stored.task_id,
            attempts: REFRESH_ATTEMPTS,
        })
    }
}

/// Conflicting writes tolerated before a repeated signal is given up on.
const REFRESH_ATTEMPTS: u32 = 3;

/// Copies the new error details onto `stored`. An operator-set priority is kept.
fn with_repeated_failure(stored: &DlqEntry, incoming: &DlqEntry) -> DlqEntry {
    let mut refreshed = stored.clone();
    refreshed.error_type = incoming.error_type.clone();
    refreshed.error_message = incoming.error_message.clone();
    refreshed.stack_trace = incoming.stack_trace.clone();
    refreshed.error_category = incoming.error_category;
    if !stored.manual_intervention {
        refreshed.priority = incoming.priority;
    }
    refreshed.execution_time_seconds = incoming.execution_time_seconds;
    for (key, value) in &incoming.original_metadata {
        refreshed.original_metadata.insert(key.clone(), value.clone());
    }
    refreshed.updated_at = Utc::now();
    refreshed
}

/// Stable key for a task invocation: SHA-256 over its name and arguments.
pub fn derive_idempotency_key(task_name: &str, args: &[Value], kwargs: &Map<String, Value>) -> String {
    let canonical = json!({ "task": task_name, "args": args, "kwargs": kwargs }).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::CaptureConfig;
    use crate::notify::NoopMetrics;
    use crate::queue::entry::{DlqPriority, DlqStatus, ErrorCategory};
    use crate::queue::InMemoryRepository;

    fn capture_with(repo: Arc<InMemoryRepository>) -> DlqCapture {
        DlqCapture::new(
            repo,
            ErrorClassifier::default(),
            Redactor::new(&CaptureConfig::default().redact_keys).unwrap(),
            Arc::new(NoopMetrics),
            3,
            Duration::from_secs(5),
        )
    }

    fn signal(task_id: &str, task_name: &str) -> FailureSignal {
        let mut metadata = Map::new();
        metadata.insert("smtp_password".to_string(), json!("hunter2"));
        metadata.insert("hostname".to_string(), json!("worker-1"));

        FailureSignal {
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
            args: vec![json!("inv-42")],
            kwargs: Map::new(),
            worker_name: Some("worker-1".to_string()),
            queue_name: Some("invoices".to_string()),
            correlation_id: Some("inv-42".to_string()),
            error_type: "ConnectionError".to_string(),
            error_message: "connection refused".to_string(),
            stack_trace: None,
            idempotency_key: None,
            execution_time_seconds: Some(1.5),
            max_retries: None,
            metadata,
        }
    }

    #[tokio::test]
    async fn test_capture_classifies_and_redacts() {
        let repo = Arc::new(InMemoryRepository::new());
        let capture = capture_with(repo.clone());

        let entry = capture
            .capture(signal("t-1", "invoices.process_invoice"))
            .await
            .unwrap();

        assert_eq!(entry.error_category, ErrorCategory::Network);
        assert_eq!(entry.priority, DlqPriority::High);
        assert_eq!(entry.original_metadata["smtp_password"], json!(redact::REDACTED));
        assert_eq!(entry.original_metadata["hostname"], json!("worker-1"));
        assert_eq!(entry.idempotency_key.as_ref().map(String::len), Some(64));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_repeated_signal_updates_instead_of_duplicating() {
        let repo = Arc::new(InMemoryRepository::new());
        let capture = capture_with(repo.clone());

        let first = capture.capture(signal("t-1", "export_report")).await.unwrap();

        let mut again = signal("t-1", "export_report");
        again.error_type = "OperationalError".to_string();
        again.error_message = "disk full".to_string();
        let second = capture.capture(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.error_category, ErrorCategory::System);
        assert_eq!(second.priority, DlqPriority::Critical);
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_refresh_does_not_roll_back_a_finished_redrive() {
        let repo = Arc::new(InMemoryRepository::new());
        let capture = capture_with(repo.clone());
        let first = capture.capture(signal("t-1", "export_report")).await.unwrap();

        // Read by the capture path before a redrive completes the entry.
        let stale = repo.get_by_task_id("t-1").await.unwrap().unwrap();
        let mut finished = stale.clone();
        finished.begin_attempt(Utc::now());
        repo.update(&finished).await.unwrap();
        finished.record_success(Utc::now());
        repo.update(&finished).await.unwrap();

        let mut again = signal("t-1", "export_report");
        again.error_message = "connection reset".to_string();
        let incoming = capture.build_entry(again);
        let refreshed = capture.refresh_from_entry(stale, &incoming).await.unwrap();

        assert_eq!(refreshed.id, first.id);
        let stored = repo.get_by_id(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DlqStatus::Completed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.redrive_history.len(), 1);
        assert_eq!(stored.error_message, "connection reset");
    }

    #[tokio::test]
    async fn test_refresh_keeps_operator_priority() {
        let repo = Arc::new(InMemoryRepository::new());
        let capture = capture_with(repo.clone());
        let mut entry = capture.capture(signal("t-1", "export_report")).await.unwrap();

        entry.priority = DlqPriority::Low;
        entry.record_intervention("parked until the vendor replies");
        entry.updated_at = Utc::now();
        repo.update(&entry).await.unwrap();

        let mut again = signal("t-1", "export_report");
        again.error_type = "OperationalError".to_string();
        again.error_message = "disk full".to_string();
        let refreshed = capture.capture(again).await.unwrap();

        assert_eq!(refreshed.error_category, ErrorCategory::System);
        assert_eq!(refreshed.priority, DlqPriority::Low);
    }

    #[tokio::test]
    async fn test_storage_outage_is_reported_to_callers_that_ask() {
        let mut repo = crate::queue::repository::MockDlqRepository::new();
        repo.expect_get_by_task_id()
            .returning(|_| Err(StorageError::Backend("connection refused".to_string())));
        repo.expect_create().never();
        let capture = DlqCapture::new(
            Arc::new(repo),
            ErrorClassifier::default(),
            Redactor::new(&CaptureConfig::default().redact_keys).unwrap(),
            Arc::new(NoopMetrics),
            3,
            Duration::from_secs(5),
        );

        let result = capture.try_capture(signal("t-1", "export_report")).await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
        assert!(capture.capture(signal("t-1", "export_report")).await.is_none());
        assert!(matches!(
            capture.try_capture(signal("t-2", "dlq.auto_redrive")).await,
            Ok(None)
        ));
    }

    #[tokio::test]
    async fn test_internal_tasks_are_ignored() {
        let repo = Arc::new(InMemoryRepository::new());
        let capture = capture_with(repo.clone());

        assert!(capture.capture(signal("t-1", "dlq.auto_redrive")).await.is_none());
        assert!(repo.is_empty().await);
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let kwargs = Map::new();
        let a = derive_idempotency_key("send_email", &[json!(1)], &kwargs);
        let b = derive_idempotency_key("send_email", &[json!(1)], &kwargs);
        let c = derive_idempotency_key("send_email", &[json!(2)], &kwargs);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
