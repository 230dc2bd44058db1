//! Semantic validation for configuration values.

use crate::breaker::{BreakerSettings, TaskBucket};
use crate::config::model::{AppConfig, GlobalConfig};

use super::{ValidationIssue, ValidationResult};

/// Validates semantic correctness of configuration values.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_global(&config.global, &mut result);
    validate_capture(config, &mut result);
    validate_redrive(config, &mut result);
    validate_breakers(config, &mut result);
    validate_health(config, &mut result);
    validate_retention(config, &mut result);

    result
}

/// Validates global configuration settings.
fn validate_global(global: &GlobalConfig, result: &mut ValidationResult) {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&global.log_level.as_str()) {
        result.add(
            ValidationIssue::error("global.log_level", format!("Invalid log level: '{}'", global.log_level))
                .with_suggestion(format!("Valid levels: {}", valid_levels.join(", "))),
        );
    }

    if global.redis.port == 0 {
        result.add(ValidationIssue::error(
            "global.redis.port",
            "Redis port cannot be 0",
        ));
    }

    if global.storage.timeout_seconds == 0 {
        result.add(ValidationIssue::error(
            "global.storage.timeout_seconds",
            "Storage timeout must be at least 1 second",
        ));
    }

    if global.prometheus.enabled && global.prometheus.port == 0 {
        result.add(ValidationIssue::error(
            "global.prometheus.port",
            "Prometheus port cannot be 0 when enabled",
        ));
    }
}

fn validate_capture(config: &AppConfig, result: &mut ValidationResult) {
    let capture = &config.capture;

    for (i, pattern) in capture.excluded_task_patterns.iter().enumerate() {
        if let Err(e) = glob::Pattern::new(pattern) {
            result.add(ValidationIssue::error(
                format!("capture.excluded_task_patterns[{}]", i),
                format!("Invalid glob pattern '{}': {}", pattern, e),
            ));
        }
    }

    if !capture
        .excluded_task_patterns
        .iter()
        .any(|p| glob::Pattern::new(p).map_or(false, |p| p.matches("dlq.auto_redrive")))
    {
        result.add(
            ValidationIssue::warning(
                "capture.excluded_task_patterns",
                "The DLQ's own tasks are not excluded and their failures will be captured",
            )
            .with_suggestion("Add 'dlq.*' to the exclusion list"),
        );
    }

    if capture.default_max_retries == 0 {
        result.add(
            ValidationIssue::warning(
                "capture.default_max_retries",
                "A retry budget of 0 means entries can only be redriven with force",
            ),
        );
    }

    if capture.listener_enabled && capture.poll_interval_ms == 0 {
        result.add(ValidationIssue::error(
            "capture.poll_interval_ms",
            "Poll interval must be at least 1 millisecond",
        ));
    }
}

fn validate_redrive(config: &AppConfig, result: &mut ValidationResult) {
    let redrive = &config.redrive;

    if redrive.backoff.base_seconds == 0 {
        result.add(ValidationIssue::error(
            "redrive.backoff.base_seconds",
            "Backoff base must be at least 1 second",
        ));
    }

    if redrive.backoff.max_seconds < redrive.backoff.base_seconds {
        result.add(
            ValidationIssue::error(
                "redrive.backoff.max_seconds",
                format!(
                    "Backoff cap {}s is below the base delay {}s",
                    redrive.backoff.max_seconds, redrive.backoff.base_seconds
                ),
            )
            .with_suggestion("Set max_seconds to at least base_seconds"),
        );
    }

    if redrive.execution_timeout_seconds == 0 {
        result.add(ValidationIssue::error(
            "redrive.execution_timeout_seconds",
            "Execution timeout must be at least 1 second",
        ));
    }

    if redrive.auto.enabled {
        if redrive.auto.interval_seconds == 0 {
            result.add(ValidationIssue::error(
                "redrive.auto.interval_seconds",
                "Auto-redrive interval must be at least 1 second",
            ));
        }
        if redrive.auto.batch_size == 0 {
            result.add(ValidationIssue::error(
                "redrive.auto.batch_size",
                "Auto-redrive batch size must be at least 1",
            ));
        }
    }
}

fn validate_breakers(config: &AppConfig, result: &mut ValidationResult) {
    let breakers = &config.circuit_breaker;

    validate_breaker_settings(&breakers.defaults, "circuit_breaker.defaults", result);

    for (name, settings) in &breakers.overrides {
        let path = format!("circuit_breaker.overrides.{}", name);

        if TaskBucket::from_name(name).is_none() {
            result.add(
                ValidationIssue::error(&path, format!("Unknown task bucket: '{}'", name))
                    .with_suggestion(format!("Did you mean '{}'?", find_similar_bucket(name))),
            );
            continue;
        }

        validate_breaker_settings(settings, &path, result);
    }
}

fn validate_breaker_settings(settings: &BreakerSettings, path: &str, result: &mut ValidationResult) {
    if settings.failure_threshold == 0 {
        result.add(ValidationIssue::error(
            format!("{}.failure_threshold", path),
            "Failure threshold must be at least 1",
        ));
    }

    if settings.recovery_timeout_seconds == 0 {
        result.add(
            ValidationIssue::warning(
                format!("{}.recovery_timeout_seconds", path),
                "A zero recovery timeout lets probes through immediately after opening",
            ),
        );
    }
}

fn validate_health(config: &AppConfig, result: &mut ValidationResult) {
    let health = &config.health;

    if health.interval_seconds == 0 {
        result.add(ValidationIssue::error(
            "health.interval_seconds",
            "Health interval must be at least 1 second",
        ));
    }

    if health.stats_window_days == 0 {
        result.add(ValidationIssue::error(
            "health.stats_window_days",
            "Statistics window must be at least 1 day",
        ));
    }

    let rate = health.alerts.max_failure_rate;
    if !(0.0..=1.0).contains(&rate) {
        result.add(
            ValidationIssue::error(
                "health.alerts.max_failure_rate",
                format!("Failure rate threshold {} is out of range", rate),
            )
            .with_suggestion("Failure rate is a ratio between 0 and 1"),
        );
    }

    let score = health.alerts.min_health_score;
    if !(0.0..=100.0).contains(&score) {
        result.add(
            ValidationIssue::error(
                "health.alerts.min_health_score",
                format!("Health score threshold {} is out of range", score),
            )
            .with_suggestion("Health scores run from 0 to 100"),
        );
    }
}

fn validate_retention(config: &AppConfig, result: &mut ValidationResult) {
    let retention = &config.retention;
    if !retention.enabled {
        return;
    }

    if retention.interval_seconds == 0 {
        result.add(ValidationIssue::error(
            "retention.interval_seconds",
            "Retention interval must be at least 1 second",
        ));
    }

    if retention.older_than_days == 0 {
        result.add(ValidationIssue::error(
            "retention.older_than_days",
            "Retention must keep entries for at least 1 day",
        ));
    }

    match retention.status {
        Some(status) if !status.is_terminal() => {
            result.add(
                ValidationIssue::warning(
                    "retention.status",
                    format!("Cleanup will delete '{}' entries that may still be redriven", status),
                )
                .with_suggestion("Use 'completed', 'failed_permanently' or 'archived'"),
            );
        }
        None => {
            result.add(ValidationIssue::warning(
                "retention.status",
                "Cleanup deletes old entries in every status, including pending ones",
            ));
        }
        _ => {}
    }
}

/// Finds the closest bucket name using Levenshtein distance.
fn find_similar_bucket(input: &str) -> &'static str {
    let input_lower = input.to_lowercase();

    TaskBucket::ALL
        .iter()
        .map(|bucket| bucket.as_str())
        .min_by_key(|name| strsim::levenshtein(&input_lower, name))
        .unwrap_or(TaskBucket::Default.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::entry::DlqStatus;

    #[test]
    fn test_misspelled_bucket_gets_suggestion() {
        let mut config = AppConfig::default();
        config
            .circuit_breaker
            .overrides
            .insert("emial".to_string(), BreakerSettings::default());

        let result = validate(&config);
        let issue = result.errors().next().unwrap();
        assert_eq!(issue.path, "circuit_breaker.overrides.emial");
        assert_eq!(issue.suggestion.as_deref(), Some("Did you mean 'email'?"));
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let mut config = AppConfig::default();
        config.capture.excluded_task_patterns.push("reports.[".to_string());

        let result = validate(&config);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors().any(|e| e.path == "capture.excluded_task_patterns[2]"));
    }

    #[test]
    fn test_backoff_cap_below_base() {
        let mut config = AppConfig::default();
        config.redrive.backoff.max_seconds = 30;

        let result = validate(&config);
        assert!(!result.is_valid());
        assert!(result.errors().any(|e| e.path == "redrive.backoff.max_seconds"));
    }

    #[test]
    fn test_retention_of_pending_entries_warns() {
        let mut config = AppConfig::default();
        config.retention.status = Some(DlqStatus::Pending);

        let result = validate(&config);
        assert!(result.is_valid());
        assert!(result.warnings().any(|w| w.path == "retention.status"));
    }
}
