//! Advisory redrive recommendations. Heuristic only; the engine never consults them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::queue::entry::{DlqEntry, DlqStatus, ErrorCategory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub should_redrive: bool,
    pub reason: String,
    pub suggested_action: String,
    /// Rough chance in [0, 1] that a redrive succeeds.
    pub estimated_success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg_overrides: Option<Map<String, Value>>,
}

impl Recommendation {
    fn new(should_redrive: bool, reason: &str, suggested_action: &str, rate: f64) -> Self {
        Self {
            should_redrive,
            reason: reason.to_string(),
            suggested_action: suggested_action.to_string(),
            estimated_success_rate: rate,
            arg_overrides: None,
        }
    }
}

pub fn recommend(entry: &DlqEntry) -> Recommendation {
    match entry.status {
        DlqStatus::Completed | DlqStatus::Archived => {
            return Recommendation::new(
                false,
                "Entry is already resolved",
                "No action needed",
                0.0,
            );
        }
        DlqStatus::Processing => {
            return Recommendation::new(
                false,
                "A redrive is already in flight",
                "Wait for the current attempt to finish",
                0.0,
            );
        }
        DlqStatus::Pending | DlqStatus::FailedPermanently => {}
    }

    let message = entry.error_message.to_lowercase();
    let mut rec = match entry.error_category {
        ErrorCategory::Network => Recommendation::new(
            true,
            "Network errors are usually transient",
            "Redrive after backoff",
            0.8,
        ),
        ErrorCategory::Timeout => {
            let mut rec = Recommendation::new(
                true,
                "The task ran out of time",
                "Redrive with a longer timeout",
                0.7,
            );
            let mut overrides = Map::new();
            overrides.insert("timeout".to_string(), json!(suggested_timeout(entry)));
            rec.arg_overrides = Some(overrides);
            rec
        }
        ErrorCategory::Database if message.contains("connection") => Recommendation::new(
            true,
            "Database connection errors tend to clear once the database recovers",
            "Check database health, then redrive",
            0.6,
        ),
        ErrorCategory::Database => Recommendation::new(
            false,
            "Database error is likely caused by the data itself",
            "Inspect the constraint or query failure before redriving",
            0.2,
        ),
        ErrorCategory::Validation => Recommendation::new(
            false,
            "Input failed validation and will fail again unchanged",
            "Correct the input data, then force a redrive",
            0.0,
        ),
        ErrorCategory::BusinessRule => Recommendation::new(
            false,
            "A business rule rejected the task",
            "Resolve the business condition manually",
            0.0,
        ),
        ErrorCategory::Processing => Recommendation::new(
            true,
            "Processing errors are sometimes transient",
            "Redrive once; inspect the input if it fails again",
            0.5,
        ),
        ErrorCategory::System => Recommendation::new(
            true,
            "System resource exhaustion may have cleared",
            "Check worker resources, then redrive",
            0.4,
        ),
        ErrorCategory::Unknown => Recommendation::new(
            true,
            "Error cause is unknown",
            "Review the stack trace before redriving",
            0.3,
        ),
    };

    if rec.should_redrive && entry.retries_exhausted() {
        rec.should_redrive = false;
        rec.reason = format!(
            "{} but the retry budget is spent ({}/{})",
            rec.reason, entry.retry_count, entry.max_retries
        );
        rec.suggested_action = format!("{} using force", rec.suggested_action);
        rec.estimated_success_rate /= 2.0;
    }

    rec
}

/// Doubles the observed run time, with a floor of 60 seconds.
fn suggested_timeout(entry: &DlqEntry) -> u64 {
    entry
        .execution_time_seconds
        .map(|secs| (secs * 2.0).ceil() as u64)
        .unwrap_or(0)
        .max(60)
}
