//! Error types for the DLQ redrive service.

use std::path::PathBuf;
use thiserror::Error;

use crate::queue::entry::DlqStatus;

/// Top-level application errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Redrive error: {0}")]
    Redrive(#[from] RedriveError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },

    #[error("Invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// DLQ repository errors.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Failed to connect to Redis at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("An entry for task '{task_id}' already exists")]
    DuplicateTaskId { task_id: String },

    #[error("DLQ entry not found: {id}")]
    NotFound { id: String },

    #[error("Failed to serialize entry: {0}")]
    SerializationFailed(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Gave up updating '{key}' after {attempts} conflicting writes")]
    Contention { key: String, attempts: u32 },
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::SerializationFailed(e.to_string())
    }
}

/// Reasons a redrive did not run or did not succeed.
#[derive(Error, Debug, Clone)]
pub enum RedriveError {
    #[error("DLQ entry not found: {id}")]
    NotFound { id: String },

    #[error("Entry {id} is {status} and cannot be redriven")]
    InvalidState { id: String, status: DlqStatus },

    #[error("Entry {id} exhausted its retries ({retry_count}/{max_retries}); use force to redrive")]
    RetriesExceeded {
        id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Circuit breaker for '{bucket}' is open; wait for recovery before redriving")]
    CircuitOpen { bucket: String },

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Task execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

/// Failures reported by the task execution engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Task '{task_name}' failed: {message}")]
    Failed { task_name: String, message: String },

    #[error("Task '{task_name}' timed out after {seconds} seconds")]
    Timeout { task_name: String, seconds: u64 },

    #[error("Failed to dispatch task '{task_name}': {message}")]
    DispatchFailed { task_name: String, message: String },
}

/// Notification sending errors.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Discord webhook failed: {0}")]
    DiscordFailed(String),

    #[error("Prometheus metrics export failed: {0}")]
    PrometheusFailed(String),

    #[error("HTTP request failed: {0}")]
    HttpFailed(#[from] reqwest::Error),
}
