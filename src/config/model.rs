//! Configuration data structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerPolicy, BreakerSettings, TaskBucket};
use crate::health::AlertRules;
use crate::queue::entry::DlqStatus;
use crate::redrive::BackoffPolicy;

/// Root configuration structure containing all settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global application settings.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Failure capture settings.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Redrive engine settings.
    #[serde(default)]
    pub redrive: RedriveConfig,

    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Health evaluation and alerting.
    #[serde(default)]
    pub health: HealthConfig,

    /// Periodic cleanup of old entries.
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Global application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,

    /// DLQ storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prometheus metrics settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Notification settings.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis server hostname.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis server port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis database number.
    #[serde(default)]
    pub db: u8,

    /// Optional Redis password.
    #[serde(default)]
    pub password: Option<String>,
}

impl RedisConfig {
    /// Builds the connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pass) => format!("redis://:{}@{}:{}/{}", pass, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Which repository implementation holds DLQ entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Redis,
    /// Process-local, lost on restart. For development and tests.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Upper bound on any single repository call.
    #[serde(default = "default_storage_timeout")]
    pub timeout_seconds: u64,

    /// Prefix for every Redis key the service owns.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Whether to enable the metrics and health HTTP server.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the HTTP server.
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
}

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Discord webhook settings.
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
}

/// Discord webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Discord webhook URL.
    pub webhook_url: String,

    /// Optional user or role mention added when a critical alert fires.
    #[serde(default)]
    pub mention_on_critical: Option<String>,
}

/// Failure capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Whether to consume failure signals from Redis.
    #[serde(default = "default_true")]
    pub listener_enabled: bool,

    /// Delay between polls of an empty failure list.
    #[serde(default = "default_listener_poll_ms")]
    pub poll_interval_ms: u64,

    /// Retry budget for new entries unless the signal carries its own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Glob patterns of task names that are never captured.
    #[serde(default = "default_excluded_tasks")]
    pub excluded_task_patterns: Vec<String>,

    /// Task name fragments whose correlated entities are business critical.
    #[serde(default = "default_critical_tasks")]
    pub critical_task_patterns: Vec<String>,

    /// Extra metadata key fragments to redact, on top of the built-in credential keys.
    #[serde(default)]
    pub redact_keys: Vec<String>,
}

/// Redrive engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedriveConfig {
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Upper bound on one dispatched execution.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_seconds: u64,

    /// Wait for the engine to report the outcome instead of treating enqueue as success.
    #[serde(default = "default_true")]
    pub wait_for_result: bool,

    /// Key prefix of the execution engine's task queues.
    #[serde(default = "default_dispatch_prefix")]
    pub dispatch_queue_prefix: String,

    #[serde(default)]
    pub auto: AutoRedriveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRedriveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_auto_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub defaults: BreakerSettings,

    /// Per-bucket settings keyed by bucket name (processing, validation, export, email, default).
    #[serde(default)]
    pub overrides: HashMap<String, BreakerSettings>,

    /// Keep breaker state in Redis so all workers share it. Ignored by the memory backend.
    #[serde(default = "default_true")]
    pub shared: bool,
}

impl CircuitBreakerConfig {
    /// Resolves the configured overrides. Unknown bucket names are skipped;
    /// validation reports them.
    pub fn policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            defaults: self.defaults,
            overrides: self
                .overrides
                .iter()
                .filter_map(|(name, settings)| {
                    TaskBucket::from_name(name).map(|bucket| (bucket, *settings))
                })
                .collect(),
        }
    }
}

/// Health evaluation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often statistics are refreshed and alert rules evaluated.
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,

    /// Trailing window for statistics, in days.
    #[serde(default = "default_stats_window")]
    pub stats_window_days: u32,

    #[serde(default)]
    pub alerts: AlertRules,
}

/// Retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_retention_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_retention_days")]
    pub older_than_days: u32,

    /// Only entries in this status are removed; `null` removes any status.
    #[serde(default = "default_retention_status")]
    pub status: Option<DlqStatus>,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_redis_host() -> String {
    "redis".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_storage_timeout() -> u64 {
    10
}

fn default_key_prefix() -> String {
    "dlq".to_string()
}

fn default_prometheus_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_listener_poll_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    crate::queue::entry::DEFAULT_MAX_RETRIES
}

fn default_excluded_tasks() -> Vec<String> {
    vec!["dlq.*".to_string(), "monitoring.*".to_string()]
}

fn default_critical_tasks() -> Vec<String> {
    vec!["invoice".to_string()]
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_dispatch_prefix() -> String {
    "queue:".to_string()
}

fn default_auto_interval() -> u64 {
    300
}

fn default_batch_size() -> usize {
    50
}

fn default_health_interval() -> u64 {
    60
}

fn default_stats_window() -> u32 {
    7
}

fn default_retention_interval() -> u64 {
    86_400
}

fn default_retention_days() -> u32 {
    30
}

fn default_retention_status() -> Option<DlqStatus> {
    Some(DlqStatus::Completed)
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            redis: RedisConfig::default(),
            storage: StorageConfig::default(),
            prometheus: PrometheusConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            timeout_seconds: default_storage_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_prometheus_port(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            listener_enabled: true,
            poll_interval_ms: default_listener_poll_ms(),
            default_max_retries: default_max_retries(),
            excluded_task_patterns: default_excluded_tasks(),
            critical_task_patterns: default_critical_tasks(),
            redact_keys: Vec::new(),
        }
    }
}

impl Default for RedriveConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            execution_timeout_seconds: default_execution_timeout(),
            wait_for_result: true,
            dispatch_queue_prefix: default_dispatch_prefix(),
            auto: AutoRedriveConfig::default(),
        }
    }
}

impl Default for AutoRedriveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_auto_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            defaults: BreakerSettings::default(),
            overrides: HashMap::new(),
            shared: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_interval(),
            stats_window_days: default_stats_window(),
            alerts: AlertRules::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_retention_interval(),
            older_than_days: default_retention_days(),
            status: default_retention_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("global:\n  redis: {}\n").unwrap();
        assert_eq!(config.global.storage.key_prefix, "dlq");
        assert_eq!(config.redrive.backoff, BackoffPolicy::new(60, 3600));
        assert_eq!(config.retention.status, Some(DlqStatus::Completed));
        assert_eq!(config.capture.excluded_task_patterns, vec!["dlq.*", "monitoring.*"]);
        assert!(config.circuit_breaker.shared);
    }

    #[test]
    fn test_redis_url() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://redis:6379/0");
        redis.password = Some("pw".to_string());
        assert_eq!(redis.url(), "redis://:pw@redis:6379/0");
    }

    #[test]
    fn test_breaker_overrides_resolve_known_buckets() {
        let yaml = r#"
defaults:
  failure_threshold: 5
overrides:
  email:
    failure_threshold: 2
    recovery_timeout_seconds: 600
  emial:
    failure_threshold: 1
"#;
        let config: CircuitBreakerConfig = serde_yaml::from_str(yaml).unwrap();
        let policy = config.policy();
        assert_eq!(policy.overrides.len(), 1);
        assert_eq!(policy.settings_for(TaskBucket::Email).failure_threshold, 2);
        assert_eq!(policy.settings_for(TaskBucket::Export).failure_threshold, 5);
    }
}
