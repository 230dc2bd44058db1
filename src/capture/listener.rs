//! Consumes failure signals pushed to Redis by the execution engine.
//!
//! Each signal is moved to an in-flight list before capture and only removed
//! once the entry is stored, so a storage outage cannot lose it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{DlqCapture, FailureSignal};
use crate::error::StorageError;
use crate::queue::entry::DlqEntry;

/// What happens to an in-flight signal once capture has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    /// Captured, excluded or unreadable. Drop it.
    Ack,
    /// Storage failed. Put it back for a later attempt.
    Requeue,
}

fn settle(result: &Result<Option<DlqEntry>, StorageError>) -> Settle {
    match result {
        Ok(_) => Settle::Ack,
        Err(_) => Settle::Requeue,
    }
}

/// Polls the failure list and hands each signal to [`DlqCapture`].
pub struct FailureListener {
    connection: redis::aio::ConnectionManager,
    list_key: String,
    in_flight_key: String,
    capture: Arc<DlqCapture>,
    poll_interval: Duration,
}

impl FailureListener {
    pub fn new(
        connection: redis::aio::ConnectionManager,
        prefix: &str,
        capture: Arc<DlqCapture>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            connection,
            list_key: format!("{}:failures", prefix),
            in_flight_key: format!("{}:failures:in_flight", prefix),
            capture,
            poll_interval,
        }
    }

    /// Runs until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(list = %self.list_key, "Starting failure listener");

        match self.recover_in_flight().await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "Requeued failure signals left in flight by a previous run"),
            Err(e) => error!(error = %e, "Failed to requeue in-flight failure signals"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.take().await {
                Ok(Some(payload)) => match self.handle(&payload).await {
                    Ok(Settle::Ack) => None,
                    // Storage is down; give it time before the next signal.
                    Ok(Settle::Requeue) => Some(self.poll_interval * 2),
                    Err(e) => {
                        error!(error = %e, "Failed to settle failure signal");
                        Some(self.poll_interval * 2)
                    }
                },
                // Queue drained, wait before checking again
                Ok(None) => Some(self.poll_interval),
                Err(e) => {
                    error!(error = %e, "Failed to read failure signals");
                    Some(self.poll_interval * 2)
                }
            };

            if let Some(wait) = idle {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("Failure listener stopped");
    }

    /// Moves the oldest signal onto the in-flight list and returns it.
    async fn take(&mut self) -> Result<Option<String>, redis::RedisError> {
        redis::cmd("LMOVE")
            .arg(&self.list_key)
            .arg(&self.in_flight_key)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut self.connection)
            .await
    }

    /// Captures one signal and acknowledges or requeues it.
    async fn handle(&mut self, payload: &str) -> Result<Settle, redis::RedisError> {
        let outcome = match serde_json::from_str::<FailureSignal>(payload) {
            Ok(signal) => {
                let result = self.capture.try_capture(signal).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Capture failed, signal requeued");
                }
                settle(&result)
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed failure signal");
                Settle::Ack
            }
        };

        let mut pipe = redis::pipe();
        pipe.atomic().lrem(&self.in_flight_key, 1, payload);
        if outcome == Settle::Requeue {
            pipe.rpush(&self.list_key, payload);
        }
        pipe.query_async::<_, ()>(&mut self.connection).await?;
        Ok(outcome)
    }

    /// Returns signals a crashed run left in flight to the head of the queue.
    async fn recover_in_flight(&mut self) -> Result<usize, redis::RedisError> {
        let mut moved = 0;
        loop {
            let payload: Option<String> = redis::cmd("LMOVE")
                .arg(&self.in_flight_key)
                .arg(&self.list_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut self.connection)
                .await?;
            if payload.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }
}
