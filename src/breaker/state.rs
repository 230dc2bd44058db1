//! Circuit breaker state machine.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Group of tasks sharing one breaker, derived from the task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskBucket {
    Processing,
    Validation,
    Export,
    Email,
    Default,
}

impl TaskBucket {
    pub const ALL: [TaskBucket; 5] = [
        TaskBucket::Processing,
        TaskBucket::Validation,
        TaskBucket::Export,
        TaskBucket::Email,
        TaskBucket::Default,
    ];

    /// Maps a task name to its bucket by the first keyword it contains.
    pub fn for_task(task_name: &str) -> Self {
        let name = task_name.to_lowercase();
        [
            ("processing", TaskBucket::Processing),
            ("validation", TaskBucket::Validation),
            ("export", TaskBucket::Export),
            ("email", TaskBucket::Email),
        ]
        .into_iter()
        .find(|(keyword, _)| name.contains(keyword))
        .map(|(_, bucket)| bucket)
        .unwrap_or(TaskBucket::Default)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskBucket::Processing => "processing",
            TaskBucket::Validation => "validation",
            TaskBucket::Export => "export",
            TaskBucket::Email => "email",
            TaskBucket::Default => "default",
        }
    }

    /// Parses a bucket name as written in configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        TaskBucket::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for TaskBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Redrives flow normally.
    Closed,
    /// Redrives are rejected until the recovery timeout elapses.
    Open,
    /// Recovery elapsed; the next outcome decides between closed and open.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Tunables for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before letting a probe through.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

/// Failure-counting breaker for one task bucket.
///
/// The open-to-half-open transition happens lazily when the breaker is
/// queried, not on a timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            failure_threshold: settings.failure_threshold,
            recovery_timeout_seconds: settings.recovery_timeout_seconds,
        }
    }

    /// Replaces the tunables, keeping the current state.
    pub fn apply_settings(&mut self, settings: BreakerSettings) {
        self.failure_threshold = settings.failure_threshold;
        self.recovery_timeout_seconds = settings.recovery_timeout_seconds;
    }

    pub fn can_proceed(&mut self) -> bool {
        self.can_proceed_at(Utc::now())
    }

    /// Returns whether a call may go ahead, entering half-open if recovery elapsed.
    pub fn can_proceed_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.recovery_elapsed(now) {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Utc::now());
    }

    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);

        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            self.state = CircuitState::Open;
        }
    }

    fn recovery_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_failure_time {
            Some(last) => {
                now - last >= Duration::seconds(self.recovery_timeout_seconds as i64)
            }
            None => true,
        }
    }
}
