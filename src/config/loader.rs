//! Configuration file loading and parsing.

use std::path::Path;

use anyhow::{Context, Result};

use super::model::AppConfig;
use crate::error::ConfigError;
use crate::validation::{report, validate_config};

/// Loads the configuration file from disk and parses it.
pub fn load_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse(path, &content)
}

/// Parses YAML content. An empty document yields the defaults.
pub fn parse(path: &Path, content: &str) -> Result<AppConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(AppConfig::default());
    }

    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Loads and fully validates the configuration file.
pub fn load_and_validate(path: &Path) -> Result<AppConfig> {
    let config = load_from_path(path).context("Failed to load configuration")?;

    let result = validate_config(&config);

    for issue in result.warnings() {
        tracing::warn!(path = %issue.path, "Config validation warning: {}", issue);
    }

    if !result.is_valid() {
        tracing::error!("{}", report::format_report(&result));
        anyhow::bail!(ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }

    tracing::debug!(path = %path.display(), "{}", report::format_brief_summary(&result));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_loads_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "global:\n  redis:\n    host: localhost\nredrive:\n  auto:\n    batch_size: 10\n"
        )
        .unwrap();

        let config = load_and_validate(file.path()).unwrap();
        assert_eq!(config.global.redis.host, "localhost");
        assert_eq!(config.redrive.auto.batch_size, 10);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_from_path(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "redrive:\n  backoff:\n    base_seconds: 0\n").unwrap();

        let err = load_and_validate(file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ValidationFailed { error_count: 1 })
        ));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = parse(Path::new("dlq.yaml"), "global: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
    }
}
