//! Redrive engine: eligibility, single/bulk redrive and the auto-redrive pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::executor::{ExecutionRequest, TaskExecutor};
use super::recommend::{recommend, Recommendation};
use crate::breaker::{BreakerRegistry, TaskBucket};
use crate::error::{ExecutionError, RedriveError, StorageError};
use crate::notify::MetricsSink;
use crate::queue::entry::{DlqEntry, DlqPriority, DlqStatus};
use crate::queue::repository::{with_timeout, DlqRepository};

/// Outcome of one redrive request. Never an `Err`: bulk callers keep going.
#[derive(Debug, Clone)]
pub struct RedriveOutcome {
    pub entry_id: String,
    pub success: bool,
    pub message: String,
    /// Status of the entry after the request, when it is known.
    pub status: Option<DlqStatus>,
    pub error: Option<RedriveError>,
}

impl RedriveOutcome {
    fn succeeded(entry: &DlqEntry) -> Self {
        Self {
            entry_id: entry.id.clone(),
            success: true,
            message: format!("Task {} redriven successfully", entry.task_name),
            status: Some(entry.status),
            error: None,
        }
    }

    fn failed(entry_id: &str, status: Option<DlqStatus>, error: RedriveError) -> Self {
        Self {
            entry_id: entry_id.to_string(),
            success: false,
            message: error.to_string(),
            status,
            error: Some(error),
        }
    }

    /// True when the redrive never ran: unknown id, wrong status or open breaker.
    pub fn is_skipped(&self) -> bool {
        matches!(
            self.error,
            Some(RedriveError::NotFound { .. })
                | Some(RedriveError::InvalidState { .. })
                | Some(RedriveError::CircuitOpen { .. })
        )
    }
}

/// Per-id results of a bulk redrive, in request order.
#[derive(Debug, Clone, Default)]
pub struct BulkRedriveResult {
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub results: Vec<RedriveOutcome>,
}

/// Counters from one auto-redrive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRedriveStats {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Operator overrides applied to a redrive.
#[derive(Debug, Clone, Default)]
pub struct RedriveOptions {
    /// Bypass the retry budget and reopen permanently failed entries.
    pub force: bool,
    /// Merged into the stored kwargs before dispatch.
    pub arg_overrides: Option<Map<String, Value>>,
    pub priority_override: Option<DlqPriority>,
    /// Operator's note, stored on the entry with the overrides applied.
    pub reason: Option<String>,
}

impl RedriveOptions {
    /// Audit text for the overrides in effect, or `None` for a plain redrive.
    pub fn intervention(&self) -> Option<String> {
        let mut applied = Vec::new();
        if self.force {
            applied.push("forced redrive".to_string());
        }
        if let Some(overrides) = self.arg_overrides.as_ref().filter(|o| !o.is_empty()) {
            let keys: Vec<&str> = overrides.keys().map(String::as_str).collect();
            applied.push(format!("kwargs overridden: {}", keys.join(", ")));
        }
        if let Some(priority) = self.priority_override {
            applied.push(format!("priority set to {}", priority));
        }

        match (&self.reason, applied.is_empty()) {
            (None, true) => None,
            (Some(reason), true) => Some(reason.clone()),
            (None, false) => Some(applied.join("; ")),
            (Some(reason), false) => Some(format!("{} ({})", reason, applied.join("; "))),
        }
    }
}

/// Re-submits failed tasks to the execution engine.
pub struct RedriveEngine {
    repository: Arc<dyn DlqRepository>,
    breakers: Arc<dyn BreakerRegistry>,
    executor: Arc<dyn TaskExecutor>,
    metrics: Arc<dyn MetricsSink>,
    backoff: BackoffPolicy,
    execution_timeout: Duration,
    storage_timeout: Duration,
}

impl RedriveEngine {
    pub fn new(
        repository: Arc<dyn DlqRepository>,
        breakers: Arc<dyn BreakerRegistry>,
        executor: Arc<dyn TaskExecutor>,
        metrics: Arc<dyn MetricsSink>,
        backoff: BackoffPolicy,
        execution_timeout: Duration,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            breakers,
            executor,
            metrics,
            backoff,
            execution_timeout,
            storage_timeout,
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Whether the entry may be retried automatically right now.
    pub async fn should_redrive(&self, entry: &DlqEntry) -> bool {
        self.should_redrive_at(entry, Utc::now()).await
    }

    pub async fn should_redrive_at(&self, entry: &DlqEntry, now: DateTime<Utc>) -> bool {
        if !is_eligible(entry, now, &self.backoff) {
            return false;
        }

        let bucket = TaskBucket::for_task(&entry.task_name);
        match with_timeout(self.storage_timeout, self.breakers.can_proceed(bucket)).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(bucket = %bucket, error = %e, "Breaker state unavailable, holding redrive");
                false
            }
        }
    }

    /// Redrives one entry. Failures come back in the outcome, never as a panic or `Err`.
    pub async fn redrive_single(&self, id: &str, options: &RedriveOptions) -> RedriveOutcome {
        match self.try_redrive(id, options).await {
            Ok(entry) => RedriveOutcome::succeeded(&entry),
            Err((status, error)) => {
                match &error {
                    RedriveError::Execution(_) => {
                        info!(entry_id = %id, error = %error, "Redrive attempt failed")
                    }
                    RedriveError::Storage(_) => {
                        error!(entry_id = %id, error = %error, "Redrive aborted by storage failure")
                    }
                    _ => warn!(entry_id = %id, error = %error, "Redrive rejected"),
                }
                RedriveOutcome::failed(id, status, error)
            }
        }
    }

    /// Redrives each id in order, continuing past individual failures.
    pub async fn redrive_bulk(&self, ids: &[String], options: &RedriveOptions) -> BulkRedriveResult {
        let mut result = BulkRedriveResult::default();

        for id in ids {
            let outcome = self.redrive_single(id, options).await;
            if outcome.success {
                result.success_count += 1;
            } else if outcome.is_skipped() {
                result.skipped_count += 1;
            } else {
                result.failed_count += 1;
            }
            result.results.push(outcome);
        }

        info!(
            requested = ids.len(),
            success = result.success_count,
            failed = result.failed_count,
            skipped = result.skipped_count,
            "Bulk redrive finished"
        );
        result
    }

    /// Retries the entries that are due, most urgent first.
    pub async fn auto_redrive_pending(
        &self,
        batch_size: usize,
    ) -> Result<AutoRedriveStats, StorageError> {
        let ready = with_timeout(
            self.storage_timeout,
            self.repository.entries_ready_for_retry(batch_size),
        )
        .await?;

        let mut stats = AutoRedriveStats::default();
        let options = RedriveOptions::default();

        for entry in ready {
            stats.processed += 1;

            if !self.should_redrive(&entry).await {
                debug!(entry_id = %entry.id, task_name = %entry.task_name, "Not eligible for auto-redrive");
                stats.skipped += 1;
                continue;
            }

            let outcome = self.redrive_single(&entry.id, &options).await;
            if outcome.success {
                stats.successful += 1;
            } else if outcome.is_skipped() {
                stats.skipped += 1;
            } else {
                stats.failed += 1;
            }
        }

        if stats.processed > 0 {
            info!(
                processed = stats.processed,
                successful = stats.successful,
                failed = stats.failed,
                skipped = stats.skipped,
                "Auto-redrive pass finished"
            );
        }
        Ok(stats)
    }

    /// Advisory recommendation for an entry.
    pub async fn recommendations(&self, id: &str) -> Result<Recommendation, RedriveError> {
        let entry = with_timeout(self.storage_timeout, self.repository.get_by_id(id))
            .await?
            .ok_or_else(|| RedriveError::NotFound { id: id.to_string() })?;
        Ok(recommend(&entry))
    }

    async fn try_redrive(
        &self,
        id: &str,
        options: &RedriveOptions,
    ) -> Result<DlqEntry, Rejection> {
        let mut entry = with_timeout(self.storage_timeout, self.repository.get_by_id(id))
            .await
            .map_err(|e| reject(None, e))?
            .ok_or_else(|| reject(None, RedriveError::NotFound { id: id.to_string() }))?;
        let status = Some(entry.status);

        if !options.force && entry.retries_exhausted() {
            return Err((
                status,
                RedriveError::RetriesExceeded {
                    id: entry.id.clone(),
                    retry_count: entry.retry_count,
                    max_retries: entry.max_retries,
                },
            ));
        }

        let allowed = match entry.status {
            DlqStatus::Pending => true,
            DlqStatus::FailedPermanently => options.force,
            _ => false,
        };
        if !allowed {
            return Err((
                status,
                RedriveError::InvalidState {
                    id: entry.id.clone(),
                    status: entry.status,
                },
            ));
        }

        // Forced redrives still respect the breaker.
        let bucket = TaskBucket::for_task(&entry.task_name);
        let can_proceed = with_timeout(self.storage_timeout, self.breakers.can_proceed(bucket))
            .await
            .map_err(|e| reject(status, e))?;
        if !can_proceed {
            return Err((
                status,
                RedriveError::CircuitOpen {
                    bucket: bucket.to_string(),
                },
            ));
        }

        let now = Utc::now();
        if let Some(overrides) = &options.arg_overrides {
            entry.merge_kwargs(overrides);
        }
        if let Some(priority) = options.priority_override {
            entry.priority = priority;
        }
        if let Some(reason) = options.intervention() {
            entry.record_intervention(reason);
        }

        if entry.status == DlqStatus::FailedPermanently {
            entry.reopen(now);
            self.claim(&entry, DlqStatus::FailedPermanently).await?;
            info!(entry_id = %entry.id, task_name = %entry.task_name, "Reopened permanently failed entry");
        }

        entry.begin_attempt(now);
        self.claim(&entry, DlqStatus::Pending).await?;

        info!(
            entry_id = %entry.id,
            task_id = %entry.task_id,
            task_name = %entry.task_name,
            category = %entry.error_category,
            bucket = %bucket,
            attempt = entry.retry_count + 1,
            force = options.force,
            "Redriving task"
        );

        let started = Instant::now();
        let result = self.execute(&entry).await;
        let elapsed = started.elapsed();
        let finished_at = Utc::now();

        match result {
            Ok(()) => {
                entry.record_success(finished_at);
                self.record_breaker(bucket, true).await;
                self.metrics.redrive_attempted(bucket, true, elapsed);
                self.metrics.entry_finished(&entry);
                self.persist(&entry).await?;
                Ok(entry)
            }
            Err(e) => {
                entry.record_failure(finished_at, e.to_string(), &self.backoff);
                self.record_breaker(bucket, false).await;
                self.metrics.redrive_attempted(bucket, false, elapsed);
                if entry.status == DlqStatus::FailedPermanently {
                    warn!(
                        entry_id = %entry.id,
                        task_name = %entry.task_name,
                        retry_count = entry.retry_count,
                        "Entry failed permanently"
                    );
                    self.metrics.entry_finished(&entry);
                }
                self.persist(&entry).await?;
                Err((Some(entry.status), RedriveError::Execution(e)))
            }
        }
    }

    /// Writes `entry` only if the stored status is still `from` and the state
    /// machine allows the move to `entry.status`.
    async fn claim(&self, entry: &DlqEntry, from: DlqStatus) -> Result<(), Rejection> {
        if !from.can_transition_to(entry.status) {
            return Err((
                Some(from),
                RedriveError::InvalidState {
                    id: entry.id.clone(),
                    status: from,
                },
            ));
        }

        let claimed = with_timeout(
            self.storage_timeout,
            self.repository.update_if_status(entry, from),
        )
        .await
        .map_err(|e| reject(Some(from), e))?;
        if claimed {
            return Ok(());
        }

        // Another worker moved the entry first.
        let current = self
            .current_status(&entry.id)
            .await
            .unwrap_or(DlqStatus::Processing);
        Err((
            Some(current),
            RedriveError::InvalidState {
                id: entry.id.clone(),
                status: current,
            },
        ))
    }

    async fn execute(&self, entry: &DlqEntry) -> Result<(), ExecutionError> {
        let request = ExecutionRequest::from_entry(entry);
        match tokio::time::timeout(self.execution_timeout, self.executor.execute(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout {
                task_name: entry.task_name.clone(),
                seconds: self.execution_timeout.as_secs(),
            }),
        }
    }

    async fn persist(&self, entry: &DlqEntry) -> Result<(), Rejection> {
        with_timeout(self.storage_timeout, self.repository.update(entry))
            .await
            .map_err(|e| {
                error!(
                    entry_id = %entry.id,
                    status = %entry.status,
                    error = %e,
                    "Failed to record redrive outcome"
                );
                reject(Some(DlqStatus::Processing), e)
            })
    }

    async fn record_breaker(&self, bucket: TaskBucket, success: bool) {
        let result = if success {
            with_timeout(self.storage_timeout, self.breakers.record_success(bucket)).await
        } else {
            with_timeout(self.storage_timeout, self.breakers.record_failure(bucket)).await
        };
        if let Err(e) = result {
            warn!(bucket = %bucket, error = %e, "Failed to update circuit breaker");
        }
    }

    async fn current_status(&self, id: &str) -> Option<DlqStatus> {
        with_timeout(self.storage_timeout, self.repository.get_by_id(id))
            .await
            .ok()
            .flatten()
            .map(|e| e.status)
    }
}

/// A redrive failure with the entry status observed when it happened.
type Rejection = (Option<DlqStatus>, RedriveError);

fn reject(status: Option<DlqStatus>, error: impl Into<RedriveError>) -> Rejection {
    (status, error.into())
}

/// Eligibility checks that need no breaker state: retry budget, backoff and category.
pub fn is_eligible(entry: &DlqEntry, now: DateTime<Utc>, backoff: &BackoffPolicy) -> bool {
    if entry.retries_exhausted() {
        return false;
    }

    if let Some(last) = entry.last_retry_at {
        if now < backoff.next_retry_at(last, entry.retry_count) {
            return false;
        }
    }

    !entry.error_category.requires_manual_correction()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerPolicy, LocalBreakerRegistry};
    use crate::notify::NoopMetrics;
    use crate::queue::entry::ErrorCategory;
    use crate::queue::InMemoryRepository;
    use crate::redrive::executor::MockTaskExecutor;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn engine(repo: Arc<InMemoryRepository>, executor: MockTaskExecutor) -> RedriveEngine {
        RedriveEngine::new(
            repo,
            Arc::new(LocalBreakerRegistry::new(BreakerPolicy::default())),
            Arc::new(executor),
            Arc::new(NoopMetrics),
            BackoffPolicy::default(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    fn network_entry(task_id: &str) -> DlqEntry {
        let mut e = DlqEntry::new(task_id, "export_csv", "ConnectionError", "refused");
        e.error_category = ErrorCategory::Network;
        e
    }

    #[test]
    fn test_validation_errors_are_never_eligible() {
        let mut e = network_entry("t-1");
        e.error_category = ErrorCategory::Validation;
        let later = Utc::now() + ChronoDuration::days(30);
        assert!(!is_eligible(&e, later, &BackoffPolicy::default()));
    }

    #[test]
    fn test_backoff_window_is_respected() {
        let now = Utc::now();
        let mut e = network_entry("t-1");
        e.retry_count = 1;
        e.last_retry_at = Some(now - ChronoDuration::seconds(90));
        // delay(1) is 120s.
        assert!(!is_eligible(&e, now, &BackoffPolicy::default()));
        assert!(is_eligible(
            &e,
            now + ChronoDuration::seconds(30),
            &BackoffPolicy::default()
        ));
    }

    #[tokio::test]
    async fn test_success_completes_entry() {
        let repo = Arc::new(InMemoryRepository::new());
        let entry = network_entry("t-1");
        repo.create(&entry).await.unwrap();

        let mut executor = MockTaskExecutor::new();
        executor
            .expect_execute()
            .withf(|req| req.kwargs.get("dry_run") == Some(&json!(false)))
            .times(1)
            .returning(|_| Ok(()));

        let mut overrides = Map::new();
        overrides.insert("dry_run".to_string(), json!(false));
        let options = RedriveOptions {
            arg_overrides: Some(overrides),
            priority_override: Some(DlqPriority::Critical),
            ..Default::default()
        };

        let outcome = engine(repo.clone(), executor)
            .redrive_single(&entry.id, &options)
            .await;
        assert!(outcome.success, "{}", outcome.message);

        let stored = repo.get_by_id(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DlqStatus::Completed);
        assert_eq!(stored.priority, DlqPriority::Critical);
        assert!(stored.manual_intervention);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.redrive_history.len(), 1);
        assert!(stored.redrive_history[0].success);
    }

    #[tokio::test]
    async fn test_failure_schedules_retry() {
        let repo = Arc::new(InMemoryRepository::new());
        let entry = network_entry("t-1");
        repo.create(&entry).await.unwrap();

        let mut executor = MockTaskExecutor::new();
        executor.expect_execute().returning(|req| {
            Err(ExecutionError::Failed {
                task_name: req.task_name.clone(),
                message: "still down".to_string(),
            })
        });

        let outcome = engine(repo.clone(), executor)
            .redrive_single(&entry.id, &RedriveOptions::default())
            .await;
        assert!(!outcome.success);
        assert!(!outcome.is_skipped());
        assert_eq!(outcome.status, Some(DlqStatus::Pending));

        let stored = repo.get_by_id(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        let last = stored.last_retry_at.unwrap();
        assert_eq!(
            stored.next_retry_at.unwrap(),
            last + ChronoDuration::seconds(120)
        );
    }

    #[tokio::test]
    async fn test_slow_execution_times_out() {
        let repo = Arc::new(InMemoryRepository::new());
        let entry = network_entry("t-1");
        repo.create(&entry).await.unwrap();

        struct Slow;

        #[async_trait::async_trait]
        impl TaskExecutor for Slow {
            async fn execute(&self, _request: &ExecutionRequest) -> Result<(), ExecutionError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let engine = RedriveEngine::new(
            repo.clone(),
            Arc::new(LocalBreakerRegistry::new(BreakerPolicy::default())),
            Arc::new(Slow),
            Arc::new(NoopMetrics),
            BackoffPolicy::default(),
            Duration::from_millis(20),
            Duration::from_secs(5),
        );

        let outcome = engine
            .redrive_single(&entry.id, &RedriveOptions::default())
            .await;
        assert!(matches!(
            outcome.error,
            Some(RedriveError::Execution(ExecutionError::Timeout { .. }))
        ));
    }

    #[test]
    fn test_intervention_describes_overrides() {
        assert_eq!(RedriveOptions::default().intervention(), None);

        let noted = RedriveOptions {
            reason: Some("ticket OPS-12".to_string()),
            ..Default::default()
        };
        assert_eq!(noted.intervention().as_deref(), Some("ticket OPS-12"));

        let mut overrides = Map::new();
        overrides.insert("region".to_string(), json!("eu"));
        let forced = RedriveOptions {
            force: true,
            arg_overrides: Some(overrides),
            ..Default::default()
        };
        assert_eq!(
            forced.intervention().as_deref(),
            Some("forced redrive; kwargs overridden: region")
        );
    }

    #[derive(Default)]
    struct CountingMetrics {
        attempts: std::sync::Mutex<Vec<bool>>,
    }

    impl MetricsSink for CountingMetrics {
        fn entry_created(&self, _entry: &DlqEntry) {}

        fn redrive_attempted(&self, _bucket: TaskBucket, success: bool, _duration: Duration) {
            self.attempts.lock().unwrap().push(success);
        }

        fn entry_finished(&self, _entry: &DlqEntry) {}

        fn cleanup_performed(&self, _deleted: usize) {}

        fn observe_stats(&self, _stats: &crate::queue::stats::DlqStats, _health_score: f64) {}
    }

    #[tokio::test]
    async fn test_only_dispatched_attempts_reach_metrics() {
        let repo = Arc::new(InMemoryRepository::new());
        let pending = network_entry("t-1");
        let mut completed = network_entry("t-2");
        completed.status = DlqStatus::Completed;
        repo.create(&pending).await.unwrap();
        repo.create(&completed).await.unwrap();

        let mut executor = MockTaskExecutor::new();
        executor.expect_execute().times(1).returning(|_| Ok(()));
        let metrics = Arc::new(CountingMetrics::default());
        let engine = RedriveEngine::new(
            repo,
            Arc::new(LocalBreakerRegistry::new(BreakerPolicy::default())),
            Arc::new(executor),
            metrics.clone(),
            BackoffPolicy::default(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        let ids = vec![completed.id.clone(), "missing".to_string(), pending.id.clone()];
        let result = engine.redrive_bulk(&ids, &RedriveOptions::default()).await;
        assert_eq!(result.skipped_count, 2);
        assert_eq!(*metrics.attempts.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_recommendations_for_unknown_entry() {
        let repo = Arc::new(InMemoryRepository::new());
        let result = engine(repo, MockTaskExecutor::new())
            .recommendations("missing")
            .await;
        assert!(matches!(result, Err(RedriveError::NotFound { .. })));
    }
}
