//! Per-bucket circuit breaker registries.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::state::{BreakerSettings, CircuitBreaker, CircuitState, TaskBucket};
use crate::error::StorageError;

/// Attempts before a contended shared-breaker update gives up.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Swaps a breaker document only if it still holds the value that was read.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    current = ''
end
if current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Breaker settings with optional per-bucket overrides.
#[derive(Debug, Clone, Default)]
pub struct BreakerPolicy {
    pub defaults: BreakerSettings,
    pub overrides: HashMap<TaskBucket, BreakerSettings>,
}

impl BreakerPolicy {
    pub fn settings_for(&self, bucket: TaskBucket) -> BreakerSettings {
        self.overrides.get(&bucket).copied().unwrap_or(self.defaults)
    }
}

/// Point-in-time view of one breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub bucket: TaskBucket,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
}

impl BreakerSnapshot {
    fn of(bucket: TaskBucket, breaker: &CircuitBreaker) -> Self {
        Self {
            bucket,
            state: breaker.state,
            failure_count: breaker.failure_count,
            last_failure_time: breaker.last_failure_time,
            failure_threshold: breaker.failure_threshold,
            recovery_timeout_seconds: breaker.recovery_timeout_seconds,
        }
    }
}

/// Breakers keyed by task bucket, consulted before every redrive.
#[async_trait]
pub trait BreakerRegistry: Send + Sync {
    /// Whether a redrive for this bucket may proceed.
    async fn can_proceed(&self, bucket: TaskBucket) -> Result<bool, StorageError>;

    async fn record_success(&self, bucket: TaskBucket) -> Result<(), StorageError>;

    async fn record_failure(&self, bucket: TaskBucket) -> Result<(), StorageError>;

    /// Current state of every bucket's breaker.
    async fn snapshot(&self) -> Result<Vec<BreakerSnapshot>, StorageError>;
}

fn log_transition(bucket: TaskBucket, before: CircuitState, after: CircuitState) {
    if before == after {
        return;
    }
    match after {
        CircuitState::Open => warn!(%bucket, from = %before, "Circuit breaker opened"),
        CircuitState::HalfOpen => info!(%bucket, "Circuit breaker half-open, probing"),
        CircuitState::Closed => info!(%bucket, from = %before, "Circuit breaker closed"),
    }
}

/// Breakers held in this process only.
pub struct LocalBreakerRegistry {
    policy: BreakerPolicy,
    breakers: Mutex<HashMap<TaskBucket, CircuitBreaker>>,
}

impl LocalBreakerRegistry {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<R>(&self, bucket: TaskBucket, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        // A poisoned lock only means another thread panicked mid-update; the
        // breaker data itself is still a valid state.
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let breaker = breakers
            .entry(bucket)
            .or_insert_with(|| CircuitBreaker::new(self.policy.settings_for(bucket)));
        let before = breaker.state;
        let result = f(breaker);
        log_transition(bucket, before, breaker.state);
        result
    }
}

#[async_trait]
impl BreakerRegistry for LocalBreakerRegistry {
    async fn can_proceed(&self, bucket: TaskBucket) -> Result<bool, StorageError> {
        Ok(self.with_breaker(bucket, |b| b.can_proceed()))
    }

    async fn record_success(&self, bucket: TaskBucket) -> Result<(), StorageError> {
        self.with_breaker(bucket, |b| b.record_success());
        Ok(())
    }

    async fn record_failure(&self, bucket: TaskBucket) -> Result<(), StorageError> {
        self.with_breaker(bucket, |b| b.record_failure());
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<BreakerSnapshot>, StorageError> {
        Ok(TaskBucket::ALL
            .into_iter()
            .map(|bucket| self.with_breaker(bucket, |b| BreakerSnapshot::of(bucket, b)))
            .collect())
    }
}

/// Breakers stored in Redis so every worker process sees the same state.
///
/// Each update is a read-modify-write guarded by a compare-and-set script.
pub struct RedisBreakerRegistry {
    connection: redis::aio::ConnectionManager,
    prefix: String,
    policy: BreakerPolicy,
}

impl RedisBreakerRegistry {
    pub fn new(connection: redis::aio::ConnectionManager, prefix: &str, policy: BreakerPolicy) -> Self {
        Self {
            connection,
            prefix: prefix.to_string(),
            policy,
        }
    }

    fn key(&self, bucket: TaskBucket) -> String {
        format!("{}:breaker:{}", self.prefix, bucket)
    }

    fn decode(&self, bucket: TaskBucket, raw: Option<&str>) -> CircuitBreaker {
        let settings = self.policy.settings_for(bucket);
        let mut breaker = raw
            .and_then(|json| serde_json::from_str::<CircuitBreaker>(json).ok())
            .unwrap_or_else(|| CircuitBreaker::new(settings));
        breaker.apply_settings(settings);
        breaker
    }

    async fn read(&self, bucket: TaskBucket) -> Result<(Option<String>, CircuitBreaker), StorageError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(bucket))
            .query_async(&mut conn)
            .await?;
        let breaker = self.decode(bucket, raw.as_deref());
        Ok((raw, breaker))
    }

    async fn modify<R>(
        &self,
        bucket: TaskBucket,
        f: impl Fn(&mut CircuitBreaker) -> R + Send + Sync,
    ) -> Result<R, StorageError>
    where
        R: Send,
    {
        let key = self.key(bucket);
        let script = redis::Script::new(CAS_SCRIPT);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, mut breaker) = self.read(bucket).await?;
            let before = breaker.state;
            let result = f(&mut breaker);
            let updated = serde_json::to_string(&breaker)?;

            if raw.as_deref() == Some(updated.as_str()) {
                return Ok(result);
            }

            let mut conn = self.connection.clone();
            let swapped: i64 = script
                .key(&key)
                .arg(raw.unwrap_or_default())
                .arg(&updated)
                .invoke_async(&mut conn)
                .await?;

            if swapped == 1 {
                log_transition(bucket, before, breaker.state);
                return Ok(result);
            }
        }

        Err(StorageError::Contention {
            key,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

#[async_trait]
impl BreakerRegistry for RedisBreakerRegistry {
    async fn can_proceed(&self, bucket: TaskBucket) -> Result<bool, StorageError> {
        self.modify(bucket, |b| b.can_proceed()).await
    }

    async fn record_success(&self, bucket: TaskBucket) -> Result<(), StorageError> {
        self.modify(bucket, |b| b.record_success()).await
    }

    async fn record_failure(&self, bucket: TaskBucket) -> Result<(), StorageError> {
        self.modify(bucket, |b| b.record_failure()).await
    }

    async fn snapshot(&self) -> Result<Vec<BreakerSnapshot>, StorageError> {
        let mut snapshots = Vec::with_capacity(TaskBucket::ALL.len());
        for bucket in TaskBucket::ALL {
            let (_, breaker) = self.read(bucket).await?;
            snapshots.push(BreakerSnapshot::of(bucket, &breaker));
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32) -> LocalBreakerRegistry {
        let mut policy = BreakerPolicy::default();
        policy.overrides.insert(
            TaskBucket::Export,
            BreakerSettings {
                failure_threshold: threshold,
                recovery_timeout_seconds: 3600,
            },
        );
        LocalBreakerRegistry::new(policy)
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let registry = registry(2);

        registry.record_failure(TaskBucket::Export).await.unwrap();
        registry.record_failure(TaskBucket::Export).await.unwrap();

        assert!(!registry.can_proceed(TaskBucket::Export).await.unwrap());
        assert!(registry.can_proceed(TaskBucket::Email).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_covers_every_bucket() {
        let registry = registry(1);
        registry.record_failure(TaskBucket::Export).await.unwrap();

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), TaskBucket::ALL.len());

        let export = snapshot
            .iter()
            .find(|s| s.bucket == TaskBucket::Export)
            .unwrap();
        assert_eq!(export.state, CircuitState::Open);
        assert_eq!(export.failure_threshold, 1);

        let default = snapshot
            .iter()
            .find(|s| s.bucket == TaskBucket::Default)
            .unwrap();
        assert_eq!(default.state, CircuitState::Closed);
        assert_eq!(default.failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_success_closes_breaker() {
        let registry = registry(1);
        registry.record_failure(TaskBucket::Export).await.unwrap();
        registry.record_success(TaskBucket::Export).await.unwrap();
        assert!(registry.can_proceed(TaskBucket::Export).await.unwrap());
    }
}
