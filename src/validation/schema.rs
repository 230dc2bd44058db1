//! Structural validation: required values and well-formed identifiers.

use crate::config::model::{AppConfig, StorageBackend};
use super::{ValidationIssue, ValidationResult};

/// Validates required fields and their shape.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    let prefix = &config.global.storage.key_prefix;
    if prefix.trim().is_empty() {
        result.add(ValidationIssue::error(
            "global.storage.key_prefix",
            "Key prefix cannot be empty",
        ));
    } else if prefix.contains(char::is_whitespace) {
        result.add(ValidationIssue::error(
            "global.storage.key_prefix",
            format!("Key prefix '{}' contains whitespace", prefix),
        ));
    }

    if config.global.redis.host.trim().is_empty() {
        result.add(ValidationIssue::error(
            "global.redis.host",
            "Redis host is required",
        ));
    }

    if config.redrive.dispatch_queue_prefix.trim().is_empty() {
        result.add(
            ValidationIssue::warning(
                "redrive.dispatch_queue_prefix",
                "Empty dispatch prefix, redrives are pushed to bare queue names",
            )
            .with_suggestion("Use the execution engine's queue key prefix, e.g. 'queue:'"),
        );
    }

    if let Some(discord) = &config.global.notifications.discord {
        let url = discord.webhook_url.trim();
        if url.is_empty() {
            result.add(ValidationIssue::error(
                "global.notifications.discord.webhook_url",
                "Webhook URL is required when Discord notifications are configured",
            ));
        } else if !url.starts_with("https://") && !url.starts_with("http://") {
            result.add(
                ValidationIssue::error(
                    "global.notifications.discord.webhook_url",
                    format!("Webhook URL '{}' is not an http(s) URL", url),
                )
                .with_suggestion("Copy the full URL from the channel's integration settings"),
            );
        }
    }

    if config.global.storage.backend == StorageBackend::Memory {
        result.add(
            ValidationIssue::warning(
                "global.storage.backend",
                "In-memory storage loses every entry on restart",
            )
            .with_suggestion("Use 'redis' outside development"),
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::DiscordConfig;

    #[test]
    fn test_bad_webhook_is_an_error() {
        let mut config = AppConfig::default();
        config.global.notifications.discord = Some(DiscordConfig {
            webhook_url: "discord.com/api/webhooks/1".to_string(),
            mention_on_critical: None,
        });

        let result = validate(&config);
        assert_eq!(result.error_count(), 1);
        assert_eq!(
            result.errors().next().map(|e| e.path.as_str()),
            Some("global.notifications.discord.webhook_url")
        );
    }

    #[test]
    fn test_memory_backend_warns() {
        let mut config = AppConfig::default();
        config.global.storage.backend = StorageBackend::Memory;

        let result = validate(&config);
        assert!(result.is_valid());
        assert_eq!(result.warnings().count(), 1);
    }
}
