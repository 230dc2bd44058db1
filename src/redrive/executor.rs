//! Port to the task execution engine and its Redis-backed implementation.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::queue::entry::{DlqEntry, DlqPriority};

/// A request to run a named task again with its reconstructed arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique per dispatch; the engine reports the outcome under this id.
    pub dispatch_id: String,
    /// Task this request re-runs.
    pub original_task_id: String,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: Option<String>,
    pub priority: DlqPriority,
}

impl ExecutionRequest {
    /// Builds a request from the entry's current (possibly overridden) arguments.
    pub fn from_entry(entry: &DlqEntry) -> Self {
        Self {
            dispatch_id: Uuid::new_v4().to_string(),
            original_task_id: entry.task_id.clone(),
            task_name: entry.task_name.clone(),
            args: entry.task_args.clone(),
            kwargs: entry.task_kwargs.clone(),
            queue: entry.queue_name.clone(),
            priority: entry.priority,
        }
    }
}

/// Runs a named task with arguments and reports the outcome.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<(), ExecutionError>;
}

/// Result the execution engine writes back for a dispatched request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Dispatches requests by pushing them onto the engine's Redis queues.
pub struct RedisTaskDispatcher {
    connection: redis::aio::ConnectionManager,
    /// Queue key prefix; the request's queue name (or `default`) is appended.
    dispatch_prefix: String,
    result_prefix: String,
    wait_for_result: bool,
    result_timeout: Duration,
    poll_interval: Duration,
}

impl RedisTaskDispatcher {
    pub fn new(
        connection: redis::aio::ConnectionManager,
        key_prefix: &str,
        dispatch_prefix: &str,
        wait_for_result: bool,
        result_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            dispatch_prefix: dispatch_prefix.to_string(),
            result_prefix: format!("{}:result:", key_prefix),
            wait_for_result,
            result_timeout,
            poll_interval: Duration::from_millis(500),
        }
    }

    fn queue_key(&self, request: &ExecutionRequest) -> String {
        format!(
            "{}{}",
            self.dispatch_prefix,
            request.queue.as_deref().unwrap_or("default")
        )
    }

    async fn await_result(&self, request: &ExecutionRequest) -> Result<(), ExecutionError> {
        let key = format!("{}{}", self.result_prefix, request.dispatch_id);
        let deadline = tokio::time::Instant::now() + self.result_timeout;
        let mut conn = self.connection.clone();

        loop {
            let raw: Option<String> =
                conn.get(&key)
                    .await
                    .map_err(|e| ExecutionError::DispatchFailed {
                        task_name: request.task_name.clone(),
                        message: e.to_string(),
                    })?;

            if let Some(raw) = raw {
                let _: Result<(), redis::RedisError> = conn.del(&key).await;
                let result: DispatchResult =
                    serde_json::from_str(&raw).map_err(|e| ExecutionError::DispatchFailed {
                        task_name: request.task_name.clone(),
                        message: format!("malformed result: {}", e),
                    })?;

                return if result.success {
                    Ok(())
                } else {
                    Err(ExecutionError::Failed {
                        task_name: request.task_name.clone(),
                        message: result.error.unwrap_or_else(|| "unknown error".to_string()),
                    })
                };
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ExecutionError::Timeout {
                    task_name: request.task_name.clone(),
                    seconds: self.result_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl TaskExecutor for RedisTaskDispatcher {
    async fn execute(&self, request: &ExecutionRequest) -> Result<(), ExecutionError> {
        let payload = serde_json::to_string(request).map_err(|e| ExecutionError::DispatchFailed {
            task_name: request.task_name.clone(),
            message: e.to_string(),
        })?;

        let queue_key = self.queue_key(request);
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .rpush(&queue_key, payload)
            .await
            .map_err(|e| ExecutionError::DispatchFailed {
                task_name: request.task_name.clone(),
                message: e.to_string(),
            })?;

        debug!(
            dispatch_id = %request.dispatch_id,
            task_name = %request.task_name,
            queue = %queue_key,
            "Dispatched redrive request"
        );

        if self.wait_for_result {
            self.await_result(request).await
        } else {
            Ok(())
        }
    }
}
