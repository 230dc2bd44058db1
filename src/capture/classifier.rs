//! Error classification and prioritisation.

use crate::config::model::CaptureConfig;
use crate::error::ConfigError;
use crate::queue::entry::{DlqPriority, ErrorCategory};

/// Keyword rules evaluated in order; the first rule with a hit wins.
const CATEGORY_RULES: &[(&[&str], ErrorCategory)] = &[
    (
        &["connection", "network", "unreachable", "timeout", "timed out"],
        ErrorCategory::Network,
    ),
    (
        &["database", "sql", "integrity", "constraint"],
        ErrorCategory::Database,
    ),
    (
        &["validation", "invalid", "malformed", "schema"],
        ErrorCategory::Validation,
    ),
    (
        &["business", "rule", "policy", "permission"],
        ErrorCategory::BusinessRule,
    ),
    (
        &["memory", "disk", "system", "resource"],
        ErrorCategory::System,
    ),
    (
        &["processing", "parse", "extract", "transform"],
        ErrorCategory::Processing,
    ),
];

/// Turns raw failure signals into categories and priorities.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    /// Lowercased substrings marking tasks whose correlated entities are business critical.
    critical_task_patterns: Vec<String>,
    /// Tasks that are never captured (the DLQ's own maintenance and monitoring tasks).
    excluded_tasks: Vec<glob::Pattern>,
}

impl ErrorClassifier {
    pub fn new(critical_task_patterns: Vec<String>, excluded_tasks: Vec<glob::Pattern>) -> Self {
        Self {
            critical_task_patterns: critical_task_patterns
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
            excluded_tasks,
        }
    }

    /// Builds a classifier from the capture section of the configuration.
    pub fn from_config(config: &CaptureConfig) -> Result<Self, ConfigError> {
        let excluded = config
            .excluded_task_patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(config.critical_task_patterns.clone(), excluded))
    }

    /// Classifies an error from its type name and message.
    pub fn classify(&self, error_type: &str, error_message: &str) -> ErrorCategory {
        let text = format!("{} {}", error_type, error_message).to_lowercase();

        let category = CATEGORY_RULES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| text.contains(k)))
            .map(|(_, category)| *category)
            .unwrap_or(ErrorCategory::Unknown);

        if category == ErrorCategory::Network
            && (text.contains("timeout") || text.contains("timed out"))
        {
            ErrorCategory::Timeout
        } else {
            category
        }
    }

    /// Picks a priority for a newly captured failure.
    pub fn determine_priority(
        &self,
        category: ErrorCategory,
        task_name: &str,
        correlated_entity_id: Option<&str>,
    ) -> DlqPriority {
        if matches!(category, ErrorCategory::System | ErrorCategory::Database) {
            return DlqPriority::Critical;
        }

        if correlated_entity_id.is_some() && self.is_critical_task(task_name) {
            return DlqPriority::High;
        }

        match category {
            ErrorCategory::Network | ErrorCategory::Timeout => DlqPriority::High,
            ErrorCategory::Processing | ErrorCategory::Validation => DlqPriority::Normal,
            ErrorCategory::BusinessRule => DlqPriority::Low,
            _ => DlqPriority::Normal,
        }
    }

    /// Returns false for tasks the DLQ must not record.
    pub fn should_capture(&self, task_name: &str) -> bool {
        !self.excluded_tasks.iter().any(|p| p.matches(task_name))
    }

    fn is_critical_task(&self, task_name: &str) -> bool {
        let name = task_name.to_lowercase();
        self.critical_task_patterns.iter().any(|p| name.contains(p))
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        // Default patterns are static and always valid globs.
        Self::from_config(&CaptureConfig::default()).unwrap_or_else(|_| Self::new(Vec::new(), Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::default()
    }

    #[test]
    fn test_keyword_categories() {
        let c = classifier();
        assert_eq!(
            c.classify("ConnectionError", "host unreachable"),
            ErrorCategory::Network
        );
        assert_eq!(
            c.classify("ConnectionError", "read timeout after 30s"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            c.classify("IntegrityError", "duplicate key value"),
            ErrorCategory::Database
        );
        assert_eq!(
            c.classify("ValueError", "invalid invoice total"),
            ErrorCategory::Validation
        );
        assert_eq!(
            c.classify("PermissionDenied", "user lacks approval role"),
            ErrorCategory::BusinessRule
        );
        assert_eq!(c.classify("MemoryError", ""), ErrorCategory::System);
        assert_eq!(
            c.classify("ParseError", "unexpected token"),
            ErrorCategory::Processing
        );
        assert_eq!(c.classify("KeyError", "'vendor'"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_rule_order_is_significant() {
        let c = classifier();
        // Mentions both a network and a database keyword: network rule comes first.
        assert_eq!(
            c.classify("OperationalError", "database connection refused"),
            ErrorCategory::Network
        );
        // Validation precedes processing.
        assert_eq!(
            c.classify("ExtractError", "malformed pdf"),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_timeout_alone_is_timeout() {
        assert_eq!(
            classifier().classify("SoftTimeLimitExceeded", "task timed out"),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let c = classifier();
        let first = c.classify("OperationalError", "disk full");
        let second = c.classify("OperationalError", "disk full");
        assert_eq!(first, second);
    }

    #[test]
    fn test_priorities() {
        let c = classifier();
        assert_eq!(
            c.determine_priority(ErrorCategory::Database, "export_csv", None),
            DlqPriority::Critical
        );
        assert_eq!(
            c.determine_priority(ErrorCategory::System, "process_invoice", Some("inv-1")),
            DlqPriority::Critical
        );
        assert_eq!(
            c.determine_priority(ErrorCategory::BusinessRule, "approve_invoice", Some("inv-1")),
            DlqPriority::High
        );
        assert_eq!(
            c.determine_priority(ErrorCategory::BusinessRule, "approve_invoice", None),
            DlqPriority::Low
        );
        assert_eq!(
            c.determine_priority(ErrorCategory::Timeout, "export_csv", None),
            DlqPriority::High
        );
        assert_eq!(
            c.determine_priority(ErrorCategory::Validation, "export_csv", None),
            DlqPriority::Normal
        );
        assert_eq!(
            c.determine_priority(ErrorCategory::Unknown, "export_csv", None),
            DlqPriority::Normal
        );
    }

    #[test]
    fn test_internal_tasks_are_not_captured() {
        let c = classifier();
        assert!(!c.should_capture("dlq.auto_redrive"));
        assert!(!c.should_capture("monitoring.collect_metrics"));
        assert!(c.should_capture("invoices.process_invoice"));
    }
}
