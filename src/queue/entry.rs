//! Dead letter queue entry definitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::redrive::backoff::BackoffPolicy;

/// Default number of redrive attempts before an entry fails permanently.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A captured task failure awaiting redrive or manual resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Unique identifier for this entry.
    pub id: String,

    /// Identifier of the original execution attempt. Unique across entries.
    pub task_id: String,

    /// Registered name of the failed task.
    pub task_name: String,

    /// Positional arguments of the original call.
    #[serde(default)]
    pub task_args: Vec<Value>,

    /// Keyword arguments of the original call.
    #[serde(default)]
    pub task_kwargs: Map<String, Value>,

    /// Opaque diagnostics from the execution engine, with credentials redacted.
    #[serde(default)]
    pub original_metadata: Map<String, Value>,

    /// Exception or error type name.
    pub error_type: String,

    /// Error message reported by the task.
    pub error_message: String,

    /// Stack trace, if the engine provided one.
    #[serde(default)]
    pub stack_trace: Option<String>,

    /// Classified error category.
    pub error_category: ErrorCategory,

    /// Number of redrive attempts made so far.
    pub retry_count: u32,

    /// Retry budget for automatic and non-forced redrives.
    pub max_retries: u32,

    /// When the last redrive attempt finished.
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,

    /// Earliest time the next automatic redrive may run. Only set while pending.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Current lifecycle status.
    pub status: DlqStatus,

    /// Processing priority.
    pub priority: DlqPriority,

    /// Caller-supplied or derived token guarding against duplicate side effects.
    #[serde(default)]
    pub idempotency_key: Option<String>,

    /// Business entity the task was working on (e.g. an invoice id).
    #[serde(default)]
    pub correlated_entity_id: Option<String>,

    /// Worker that reported the failure.
    #[serde(default)]
    pub worker_name: Option<String>,

    /// Queue the task was consumed from.
    #[serde(default)]
    pub queue_name: Option<String>,

    /// How long the failed execution ran.
    #[serde(default)]
    pub execution_time_seconds: Option<f64>,

    /// Timestamp when the entry was captured.
    pub created_at: DateTime<Utc>,

    /// Timestamp when the entry was last modified.
    pub updated_at: DateTime<Utc>,

    /// Timestamp when a redrive completed the task.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Append-only log of redrive attempts.
    #[serde(default)]
    pub redrive_history: Vec<RedriveAttempt>,

    /// Whether an operator has intervened on this entry.
    #[serde(default)]
    pub manual_intervention: bool,

    /// Operator-supplied reason for the intervention.
    #[serde(default)]
    pub intervention_reason: Option<String>,
}

impl DlqEntry {
    /// Creates a pending entry for a failed task with default classification.
    pub fn new(
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            task_name: task_name.into(),
            task_args: Vec::new(),
            task_kwargs: Map::new(),
            original_metadata: Map::new(),
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
            error_category: ErrorCategory::Unknown,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_retry_at: None,
            next_retry_at: None,
            status: DlqStatus::Pending,
            priority: DlqPriority::Normal,
            idempotency_key: None,
            correlated_entity_id: None,
            worker_name: None,
            queue_name: None,
            execution_time_seconds: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            redrive_history: Vec::new(),
            manual_intervention: false,
            intervention_reason: None,
        }
    }

    /// Returns true once the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Age of the entry in hours.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 3600.0
    }

    /// Merges operator-supplied keyword overrides into the stored kwargs.
    pub fn merge_kwargs(&mut self, overrides: &Map<String, Value>) {
        for (key, value) in overrides {
            self.task_kwargs.insert(key.clone(), value.clone());
        }
    }

    /// Moves a permanently failed entry back to pending ahead of a forced redrive.
    pub fn reopen(&mut self, now: DateTime<Utc>) {
        self.status = DlqStatus::Pending;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Flags the entry as changed by an operator. The latest reason wins.
    pub fn record_intervention(&mut self, reason: impl Into<String>) {
        self.manual_intervention = true;
        self.intervention_reason = Some(reason.into());
    }

    /// Marks the entry as being redriven.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = DlqStatus::Processing;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Records a successful redrive and completes the entry.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.push_attempt(now, true, None);
        self.status = DlqStatus::Completed;
        self.completed_at = Some(now);
        self.next_retry_at = None;
    }

    /// Records a failed redrive, scheduling the next retry or failing permanently.
    pub fn record_failure(&mut self, now: DateTime<Utc>, message: String, backoff: &BackoffPolicy) {
        self.push_attempt(now, false, Some(message));

        if self.retries_exhausted() {
            self.status = DlqStatus::FailedPermanently;
            self.next_retry_at = None;
        } else {
            self.status = DlqStatus::Pending;
            self.next_retry_at = Some(backoff.next_retry_at(now, self.retry_count));
        }
    }

    fn push_attempt(&mut self, now: DateTime<Utc>, success: bool, error_message: Option<String>) {
        self.retry_count += 1;
        self.redrive_history.push(RedriveAttempt {
            attempt_number: self.retry_count,
            timestamp: now,
            success,
            error_message,
        });
        self.last_retry_at = Some(now);
        self.updated_at = now;
    }
}

/// One redrive attempt. Immutable once appended to an entry's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedriveAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Whether the task succeeded.
    pub success: bool,
    /// Error reported by a failed attempt.
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Lifecycle status of a DLQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Waiting for a redrive.
    Pending,
    /// A redrive attempt is in flight.
    Processing,
    /// A redrive succeeded.
    Completed,
    /// Retries exhausted; only a forced redrive reopens it.
    FailedPermanently,
    /// Moved out of the active set by an external archival process.
    Archived,
}

impl DlqStatus {
    pub const ALL: [DlqStatus; 5] = [
        DlqStatus::Pending,
        DlqStatus::Processing,
        DlqStatus::Completed,
        DlqStatus::FailedPermanently,
        DlqStatus::Archived,
    ];

    /// Returns true for statuses no redrive will leave on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DlqStatus::Completed | DlqStatus::FailedPermanently | DlqStatus::Archived
        )
    }

    /// Returns whether the state machine has an edge from `self` to `next`.
    ///
    /// `FailedPermanently -> Pending` is only taken by forced redrives.
    pub fn can_transition_to(self, next: DlqStatus) -> bool {
        use DlqStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed | Pending | FailedPermanently) => true,
            (FailedPermanently, Pending) => true,
            (Completed | FailedPermanently, Archived) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DlqStatus::Pending => "pending",
            DlqStatus::Processing => "processing",
            DlqStatus::Completed => "completed",
            DlqStatus::FailedPermanently => "failed_permanently",
            DlqStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DlqStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DlqStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown status '{}'", s))
    }
}

/// Broad classification of what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Processing,
    Validation,
    Network,
    Database,
    Timeout,
    BusinessRule,
    System,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Processing,
        ErrorCategory::Validation,
        ErrorCategory::Network,
        ErrorCategory::Database,
        ErrorCategory::Timeout,
        ErrorCategory::BusinessRule,
        ErrorCategory::System,
        ErrorCategory::Unknown,
    ];

    /// Categories that need a data fix before any retry can succeed.
    pub fn requires_manual_correction(self) -> bool {
        matches!(self, ErrorCategory::Validation | ErrorCategory::BusinessRule)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Processing => "processing",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::BusinessRule => "business_rule",
            ErrorCategory::System => "system",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown error category '{}'", s))
    }
}

/// Processing priority. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl DlqPriority {
    pub const ALL: [DlqPriority; 4] = [
        DlqPriority::Low,
        DlqPriority::Normal,
        DlqPriority::High,
        DlqPriority::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DlqPriority::Low => "low",
            DlqPriority::Normal => "normal",
            DlqPriority::High => "high",
            DlqPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for DlqPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DlqPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DlqPriority::ALL
            .into_iter()
            .find(|priority| priority.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown priority '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn backoff() -> BackoffPolicy {
        BackoffPolicy::new(60, 3600)
    }

    #[test]
    fn test_new_entry_defaults() {
        let entry = DlqEntry::new("task-1", "process_invoice", "ValueError", "bad total");
        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.redrive_history.is_empty());
        assert!(entry.next_retry_at.is_none());
    }

    #[test]
    fn test_failure_schedules_retry_and_keeps_history_in_step() {
        let now = Utc::now();
        let mut entry = DlqEntry::new("task-1", "send_email", "ConnectionError", "refused");
        entry.begin_attempt(now);
        entry.record_failure(now, "refused again".to_string(), &backoff());

        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.redrive_history.len(), 1);
        assert_eq!(entry.next_retry_at, Some(now + Duration::seconds(120)));
        assert_eq!(entry.last_retry_at, Some(now));
    }

    #[test]
    fn test_failure_on_last_retry_fails_permanently() {
        let now = Utc::now();
        let mut entry = DlqEntry::new("task-1", "send_email", "ConnectionError", "refused");
        entry.retry_count = 2;
        entry.redrive_history = (1..=2)
            .map(|n| RedriveAttempt {
                attempt_number: n,
                timestamp: now,
                success: false,
                error_message: None,
            })
            .collect();

        entry.begin_attempt(now);
        entry.record_failure(now, "still refused".to_string(), &backoff());

        assert_eq!(entry.status, DlqStatus::FailedPermanently);
        assert!(entry.next_retry_at.is_none());
        assert_eq!(entry.redrive_history.len() as u32, entry.retry_count);
    }

    #[test]
    fn test_success_completes_entry() {
        let now = Utc::now();
        let mut entry = DlqEntry::new("task-1", "export_report", "TimeoutError", "slow");
        entry.begin_attempt(now);
        entry.record_success(now);

        assert_eq!(entry.status, DlqStatus::Completed);
        assert_eq!(entry.completed_at, Some(now));
        assert!(entry.redrive_history[0].success);
        assert_eq!(entry.redrive_history.len() as u32, entry.retry_count);
    }

    #[test]
    fn test_reopen_takes_the_forced_redrive_edge() {
        let now = Utc::now();
        let mut entry = DlqEntry::new("task-1", "send_email", "ConnectionError", "refused");
        entry.status = DlqStatus::FailedPermanently;

        let before = entry.status;
        entry.reopen(now);
        assert!(before.can_transition_to(entry.status));
        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.updated_at, now);

        entry.record_intervention("forced redrive");
        entry.record_intervention("forced redrive; priority set to critical");
        assert!(entry.manual_intervention);
        assert_eq!(
            entry.intervention_reason.as_deref(),
            Some("forced redrive; priority set to critical")
        );
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(DlqStatus::Pending.can_transition_to(DlqStatus::Processing));
        assert!(!DlqStatus::Pending.can_transition_to(DlqStatus::Completed));
        assert!(DlqStatus::Processing.can_transition_to(DlqStatus::FailedPermanently));
        assert!(DlqStatus::FailedPermanently.can_transition_to(DlqStatus::Pending));
        assert!(!DlqStatus::Completed.can_transition_to(DlqStatus::Pending));
        assert!(DlqStatus::Completed.can_transition_to(DlqStatus::Archived));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("FAILED_PERMANENTLY".parse(), Ok(DlqStatus::FailedPermanently));
        assert_eq!("business_rule".parse(), Ok(ErrorCategory::BusinessRule));
        assert_eq!(" critical ".parse(), Ok(DlqPriority::Critical));
        assert!("urgent".parse::<DlqPriority>().is_err());
        assert!(DlqPriority::Critical > DlqPriority::High);
    }
}
