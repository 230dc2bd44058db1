//! Health scoring and alert rules derived from DLQ statistics.

pub mod report;

use serde::{Deserialize, Serialize};

pub use report::{HealthReport, HealthService, HealthStatus};

use crate::queue::entry::ErrorCategory;
use crate::queue::stats::DlqStats;

/// Scores DLQ health from 0 (on fire) to 100 (nothing to worry about).
pub fn health_score(stats: &DlqStats) -> f64 {
    if stats.total_entries == 0 {
        return 100.0;
    }

    let mut score = 100.0;

    score -= tiered(stats.pending_ratio(), &[(0.5, 20.0), (0.3, 10.0), (0.1, 5.0)]);
    score -= tiered(stats.critical_ratio(), &[(0.1, 30.0), (0.05, 15.0), (0.01, 5.0)]);
    score -= tiered(stats.failure_rate(), &[(0.7, 25.0), (0.5, 15.0), (0.3, 10.0)]);
    score -= tiered(
        stats.oldest_entry_age_hours,
        &[(168.0, 20.0), (72.0, 10.0), (24.0, 5.0)],
    );

    if stats.category_count(ErrorCategory::System) > 0 {
        score -= 15.0;
    }
    if stats.category_count(ErrorCategory::Database) > 0 {
        score -= 10.0;
    }

    score.clamp(0.0, 100.0)
}

/// Deduction for the first (highest) threshold `value` exceeds.
fn tiered(value: f64, tiers: &[(f64, f64)]) -> f64 {
    tiers
        .iter()
        .find(|(threshold, _)| value > *threshold)
        .map(|(_, deduction)| *deduction)
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Threshold and observed value behind an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMetadata {
    pub threshold: f64,
    pub current_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub metadata: AlertMetadata,
}

impl Alert {
    fn new(
        severity: AlertSeverity,
        title: &str,
        message: String,
        threshold: f64,
        current_value: f64,
    ) -> Self {
        Self {
            severity,
            title: title.to_string(),
            message,
            metadata: AlertMetadata {
                threshold,
                current_value,
            },
        }
    }
}

/// Fixed-threshold alert rules. Each rule fires independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRules {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default = "default_max_critical")]
    pub max_critical: usize,

    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,

    #[serde(default = "default_max_oldest_age_hours")]
    pub max_oldest_age_hours: f64,

    #[serde(default = "default_min_health_score")]
    pub min_health_score: f64,
}

impl Default for AlertRules {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            max_critical: default_max_critical(),
            max_failure_rate: default_max_failure_rate(),
            max_oldest_age_hours: default_max_oldest_age_hours(),
            min_health_score: default_min_health_score(),
        }
    }
}

fn default_max_pending() -> usize {
    100
}

fn default_max_critical() -> usize {
    10
}

fn default_max_failure_rate() -> f64 {
    0.5
}

fn default_max_oldest_age_hours() -> f64 {
    24.0
}

fn default_min_health_score() -> f64 {
    70.0
}

/// Evaluates every alert rule against the statistics.
pub fn evaluate_alert_rules(stats: &DlqStats, rules: &AlertRules) -> Vec<Alert> {
    let mut alerts = Vec::new();

    let pending = stats.pending();
    if pending > rules.max_pending {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            "High pending DLQ backlog",
            format!("{} entries are waiting for redrive", pending),
            rules.max_pending as f64,
            pending as f64,
        ));
    }

    let critical = stats.critical();
    if critical > rules.max_critical {
        alerts.push(Alert::new(
            AlertSeverity::Critical,
            "Critical DLQ entries",
            format!("{} critical-priority entries in the DLQ", critical),
            rules.max_critical as f64,
            critical as f64,
        ));
    }

    let failure_rate = stats.failure_rate();
    if failure_rate > rules.max_failure_rate {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            "High redrive failure rate",
            format!(
                "{:.0}% of finished entries failed permanently",
                failure_rate * 100.0
            ),
            rules.max_failure_rate,
            failure_rate,
        ));
    }

    if stats.oldest_entry_age_hours > rules.max_oldest_age_hours {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            "Stale DLQ entries",
            format!(
                "Oldest entry is {:.1} hours old",
                stats.oldest_entry_age_hours
            ),
            rules.max_oldest_age_hours,
            stats.oldest_entry_age_hours,
        ));
    }

    let system_errors = stats.category_count(ErrorCategory::System);
    if system_errors > 0 {
        alerts.push(Alert::new(
            AlertSeverity::Critical,
            "System errors in DLQ",
            format!("{} entries failed with system errors", system_errors),
            0.0,
            system_errors as f64,
        ));
    }

    let score = health_score(stats);
    if score < rules.min_health_score {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            "Low DLQ health score",
            format!("DLQ health score is {:.0}", score),
            rules.min_health_score,
            score,
        ));
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::entry::{DlqPriority, DlqStatus};

    fn stats(
        total: usize,
        statuses: &[(DlqStatus, usize)],
        categories: &[(ErrorCategory, usize)],
        priorities: &[(DlqPriority, usize)],
        oldest: f64,
    ) -> DlqStats {
        DlqStats {
            window_days: 1,
            total_entries: total,
            by_status: statuses.iter().copied().collect(),
            by_category: categories.iter().copied().collect(),
            by_priority: priorities.iter().copied().collect(),
            avg_age_hours: oldest / 2.0,
            oldest_entry_age_hours: oldest,
        }
    }

    #[test]
    fn test_empty_dlq_is_perfectly_healthy() {
        assert_eq!(health_score(&DlqStats::default()), 100.0);
        assert!(evaluate_alert_rules(&DlqStats::default(), &AlertRules::default()).is_empty());
    }

    #[test]
    fn test_documented_deductions() {
        // 10 entries: 8 pending, 2 completed, 2 critical, 1 system error, all fresh.
        let s = stats(
            10,
            &[(DlqStatus::Pending, 8), (DlqStatus::Completed, 2)],
            &[(ErrorCategory::System, 1), (ErrorCategory::Network, 9)],
            &[(DlqPriority::Critical, 2), (DlqPriority::High, 8)],
            3.0,
        );

        // pending 0.8 -> -20, critical 0.2 -> -30, failure rate 0 -> 0,
        // age 3h -> 0, system errors -> -15.
        assert_eq!(health_score(&s), 35.0);
    }

    #[test]
    fn test_middle_tiers() {
        let s = stats(
            100,
            &[
                (DlqStatus::Pending, 40),
                (DlqStatus::Completed, 30),
                (DlqStatus::FailedPermanently, 30),
            ],
            &[(ErrorCategory::Database, 5)],
            &[(DlqPriority::Critical, 6)],
            80.0,
        );

        // pending 0.4 -> -10, critical 0.06 -> -15, failure 0.5 -> -10 (not > 0.5),
        // age 80h -> -10, database -> -10.
        assert_eq!(health_score(&s), 45.0);
    }

    #[test]
    fn test_score_is_clamped() {
        let s = stats(
            10,
            &[(DlqStatus::Pending, 9), (DlqStatus::FailedPermanently, 1)],
            &[(ErrorCategory::System, 5), (ErrorCategory::Database, 5)],
            &[(DlqPriority::Critical, 10)],
            500.0,
        );
        assert_eq!(health_score(&s), 0.0);
    }

    #[test]
    fn test_alert_rules_fire_independently() {
        let s = stats(
            150,
            &[(DlqStatus::Pending, 120), (DlqStatus::FailedPermanently, 30)],
            &[(ErrorCategory::System, 1)],
            &[(DlqPriority::Critical, 11)],
            30.0,
        );

        let alerts = evaluate_alert_rules(&s, &AlertRules::default());
        let titles: Vec<_> = alerts.iter().map(|a| a.title.as_str()).collect();

        assert_eq!(
            titles,
            vec![
                "High pending DLQ backlog",
                "Critical DLQ entries",
                "High redrive failure rate",
                "Stale DLQ entries",
                "System errors in DLQ",
                "Low DLQ health score",
            ]
        );
        assert_eq!(alerts[0].metadata.threshold, 100.0);
        assert_eq!(alerts[0].metadata.current_value, 120.0);
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_quiet_dlq_raises_nothing() {
        let s = stats(
            20,
            &[(DlqStatus::Completed, 20)],
            &[(ErrorCategory::Network, 20)],
            &[(DlqPriority::High, 20)],
            2.0,
        );
        assert!(evaluate_alert_rules(&s, &AlertRules::default()).is_empty());
    }
}
