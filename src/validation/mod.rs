//! Configuration validation.
//!
//! Structural checks live in [`schema`], cross-field and range checks in
//! [`semantic`]. Errors reject a config file (at startup or on hot reload);
//! warnings are logged and the file is accepted.

pub mod report;
pub mod schema;
pub mod semantic;

use std::fmt;

use serde::Serialize;

use crate::config::model::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationSeverity {
    Error,
    Warning,
}

/// One problem found in a config file.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub severity: ValidationSeverity,
    /// Dotted path of the offending field, e.g. `circuit_breaker.overrides.email`.
    pub path: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::at(ValidationSeverity::Error, path, message)
    }

    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::at(ValidationSeverity::Warning, path, message)
    }

    fn at(severity: ValidationSeverity, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == ValidationSeverity::Error
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Issues collected from every check, in the order they were found.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn extend(&mut self, other: ValidationResult) {
        self.issues.extend(other.issues);
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// True when nothing blocks loading. Warnings are allowed.
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(ValidationIssue::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| !i.is_error())
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }
}

/// Runs the schema checks, then the semantic checks.
pub fn validate_config(config: &AppConfig) -> ValidationResult {
    let mut result = schema::validate(config);
    result.extend(semantic::validate(config));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&AppConfig::default());
        assert!(result.is_valid());
        assert!(result.issues().is_empty());
    }

    #[test]
    fn test_errors_and_warnings_are_separated() {
        let mut result = ValidationResult::new();
        result.add(ValidationIssue::error("redrive.auto.batch_size", "must be at least 1"));
        result.add(
            ValidationIssue::warning("global.storage.backend", "memory backend loses entries")
                .with_suggestion("use redis"),
        );

        assert!(!result.is_valid());
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.warnings().count(), 1);
        assert_eq!(
            result.warnings().next().map(|w| w.to_string()).as_deref(),
            Some("global.storage.backend: memory backend loses entries (use redis)")
        );
    }

    #[test]
    fn test_issues_serialize_for_tooling() {
        let mut result = ValidationResult::new();
        result.add(ValidationIssue::error("global.prometheus.port", "port 0 is reserved"));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["issues"][0]["severity"], "error");
        assert!(json["issues"][0].get("suggestion").is_none());
    }
}
