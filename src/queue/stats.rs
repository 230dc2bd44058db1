//! Aggregate statistics over DLQ entries.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{DlqEntry, DlqPriority, DlqStatus, ErrorCategory};

/// Derived view of the DLQ over a trailing window. Computed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqStats {
    /// Width of the window in days.
    pub window_days: u32,
    /// Entries created inside the window.
    pub total_entries: usize,
    pub by_status: HashMap<DlqStatus, usize>,
    pub by_category: HashMap<ErrorCategory, usize>,
    pub by_priority: HashMap<DlqPriority, usize>,
    pub avg_age_hours: f64,
    pub oldest_entry_age_hours: f64,
}

impl DlqStats {
    /// Computes statistics for entries created within `days` of `now`.
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = &'a DlqEntry>,
        days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let since = now - Duration::days(i64::from(days));
        let mut stats = DlqStats {
            window_days: days,
            ..Default::default()
        };
        let mut total_age = 0.0;

        for entry in entries.into_iter().filter(|e| e.created_at >= since) {
            stats.total_entries += 1;
            *stats.by_status.entry(entry.status).or_default() += 1;
            *stats.by_category.entry(entry.error_category).or_default() += 1;
            *stats.by_priority.entry(entry.priority).or_default() += 1;

            let age = entry.age_hours(now);
            total_age += age;
            stats.oldest_entry_age_hours = stats.oldest_entry_age_hours.max(age);
        }

        if stats.total_entries > 0 {
            stats.avg_age_hours = total_age / stats.total_entries as f64;
        }

        stats
    }

    pub fn status_count(&self, status: DlqStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn category_count(&self, category: ErrorCategory) -> usize {
        self.by_category.get(&category).copied().unwrap_or(0)
    }

    pub fn priority_count(&self, priority: DlqPriority) -> usize {
        self.by_priority.get(&priority).copied().unwrap_or(0)
    }

    pub fn pending(&self) -> usize {
        self.status_count(DlqStatus::Pending)
    }

    pub fn critical(&self) -> usize {
        self.priority_count(DlqPriority::Critical)
    }

    /// Share of finished entries that failed permanently. Zero when nothing finished.
    pub fn failure_rate(&self) -> f64 {
        let failed = self.status_count(DlqStatus::FailedPermanently);
        let finished = failed + self.status_count(DlqStatus::Completed);
        if finished == 0 {
            0.0
        } else {
            failed as f64 / finished as f64
        }
    }

    fn ratio(&self, count: usize) -> f64 {
        if self.total_entries == 0 {
            0.0
        } else {
            count as f64 / self.total_entries as f64
        }
    }

    pub fn pending_ratio(&self) -> f64 {
        self.ratio(self.pending())
    }

    pub fn critical_ratio(&self) -> f64 {
        self.ratio(self.critical())
    }
}
