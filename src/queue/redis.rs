//! Redis-backed DLQ repository.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use redis::AsyncCommands;

use super::entry::{DlqEntry, DlqStatus};
use super::repository::{select_ready_for_retry, DlqRepository, ListQuery, Page};
use super::stats::DlqStats;
use crate::error::StorageError;

/// Number of keys fetched per MGET round trip.
const FETCH_CHUNK: usize = 500;

/// Inserts an entry unless its task id is already claimed.
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[2])
return 1
"#;

/// Replaces an entry only if its stored status matches. -1 when missing.
const UPDATE_IF_STATUS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
if cjson.decode(current)['status'] ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Replaces an entry only if its stored status and `updated_at` both match. -1 when missing.
const UPDATE_IF_UNCHANGED_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
local stored = cjson.decode(current)
if stored['status'] ~= ARGV[1] or stored['updated_at'] ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// Stores DLQ entries as JSON documents indexed by creation time.
///
/// Key layout under `prefix`:
/// - `{prefix}:entry:{id}` entry JSON
/// - `{prefix}:task:{task_id}` entry id
/// - `{prefix}:index` sorted set of ids scored by creation time (ms)
#[derive(Clone)]
pub struct RedisRepository {
    connection: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisRepository {
    /// Creates a repository connected to the specified Redis URL.
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self, StorageError> {
        let connection = connect(redis_url).await?;
        Ok(Self::from_connection(connection, prefix))
    }

    /// Wraps an existing connection.
    pub fn from_connection(connection: redis::aio::ConnectionManager, prefix: &str) -> Self {
        Self {
            connection,
            prefix: prefix.to_string(),
        }
    }

    fn entry_key(&self, id: &str) -> String {
        format!("{}:entry:{}", self.prefix, id)
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.prefix)
    }

    /// Fetches entries by id, skipping ids whose document has vanished.
    async fn fetch_entries(&self, ids: &[String]) -> Result<Vec<DlqEntry>, StorageError> {
        let mut conn = self.connection.clone();
        let mut entries = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(FETCH_CHUNK) {
            let keys: Vec<String> = chunk.iter().map(|id| self.entry_key(id)).collect();
            let docs: Vec<Option<String>> =
                redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

            for json in docs.into_iter().flatten() {
                entries.push(serde_json::from_str(&json)?);
            }
        }

        Ok(entries)
    }

    /// Loads every indexed entry.
    async fn load_all(&self) -> Result<Vec<DlqEntry>, StorageError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.zrange(self.index_key(), 0, -1).await?;
        self.fetch_entries(&ids).await
    }

    async fn remove(&self, entry: &DlqEntry) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        redis::pipe()
            .atomic()
            .del(self.entry_key(&entry.id))
            .del(self.task_key(&entry.task_id))
            .zrem(self.index_key(), &entry.id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DlqRepository for RedisRepository {
    async fn create(&self, entry: &DlqEntry) -> Result<(), StorageError> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.connection.clone();

        let created: i64 = redis::Script::new(CREATE_SCRIPT)
            .key(self.entry_key(&entry.id))
            .key(self.task_key(&entry.task_id))
            .key(self.index_key())
            .arg(json)
            .arg(&entry.id)
            .arg(entry.created_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(StorageError::DuplicateTaskId {
                task_id: entry.task_id.clone(),
            });
        }
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<DlqEntry>, StorageError> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(self.entry_key(id)).await?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn get_by_task_id(&self, task_id: &str) -> Result<Option<DlqEntry>, StorageError> {
        let mut conn = self.connection.clone();
        let id: Option<String> = conn.get(self.task_key(task_id)).await?;

        match id {
            Some(id) => self.get_by_id(&id).await,
            None => Ok(None),
        }
    }

    async fn list(&self, query: &ListQuery) -> Result<Page, StorageError> {
        let entries = self.load_all().await?;
        Ok(query.apply(entries))
    }

    async fn update(&self, entry: &DlqEntry) -> Result<(), StorageError> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.entry_key(&entry.id))
            .arg(json)
            .arg("XX")
            .query_async(&mut conn)
            .await?;

        match reply {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound {
                id: entry.id.clone(),
            }),
        }
    }

    async fn update_if_status(
        &self,
        entry: &DlqEntry,
        expected: DlqStatus,
    ) -> Result<bool, StorageError> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.connection.clone();

        let outcome: i64 = redis::Script::new(UPDATE_IF_STATUS_SCRIPT)
            .key(self.entry_key(&entry.id))
            .arg(expected.as_str())
            .arg(json)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(StorageError::NotFound {
                id: entry.id.clone(),
            }),
        }
    }

    async fn update_if_unchanged(
        &self,
        entry: &DlqEntry,
        observed: &DlqEntry,
    ) -> Result<bool, StorageError> {
        let json = serde_json::to_string(entry)?;
        // Same encoding the stored document used for the field.
        let observed_at = serde_json::to_value(observed.updated_at)?;
        let mut conn = self.connection.clone();

        let outcome: i64 = redis::Script::new(UPDATE_IF_UNCHANGED_SCRIPT)
            .key(self.entry_key(&entry.id))
            .arg(observed.status.as_str())
            .arg(observed_at.as_str().unwrap_or_default())
            .arg(json)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(StorageError::NotFound {
                id: entry.id.clone(),
            }),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        match self.get_by_id(id).await? {
            Some(entry) => {
                self.remove(&entry).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self, days: u32) -> Result<DlqStats, StorageError> {
        let since = Utc::now() - Duration::days(i64::from(days));
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.index_key(), since.timestamp_millis(), "+inf")
            .await?;

        let entries = self.fetch_entries(&ids).await?;
        Ok(DlqStats::from_entries(&entries, days, Utc::now()))
    }

    async fn cleanup(
        &self,
        older_than_days: u32,
        status: Option<DlqStatus>,
    ) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let mut conn = self.connection.clone();
        // Exclusive upper bound: strictly older than the cutoff.
        let ids: Vec<String> = conn
            .zrangebyscore(
                self.index_key(),
                "-inf",
                format!("({}", cutoff.timestamp_millis()),
            )
            .await?;

        let mut deleted = 0;
        for entry in self.fetch_entries(&ids).await? {
            if status.map_or(true, |s| entry.status == s) {
                self.remove(&entry).await?;
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    async fn entries_ready_for_retry(
        &self,
        batch_size: usize,
    ) -> Result<Vec<DlqEntry>, StorageError> {
        let entries = self.load_all().await?;
        Ok(select_ready_for_retry(entries, Utc::now(), batch_size))
    }
}

/// Opens a managed, auto-reconnecting connection.
pub async fn connect(redis_url: &str) -> Result<redis::aio::ConnectionManager, StorageError> {
    let client = redis::Client::open(redis_url).map_err(|e| StorageError::ConnectionFailed {
        url: redact_url(redis_url),
        message: e.to_string(),
    })?;

    client
        .get_connection_manager()
        .await
        .map_err(|e| StorageError::ConnectionFailed {
            url: redact_url(redis_url),
            message: e.to_string(),
        })
}

/// Strips the password from a Redis URL before it reaches logs or errors.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_url_hides_password() {
        assert_eq!(
            redact_url("redis://:hunter2@redis:6379/0"),
            "redis://***@redis:6379/0"
        );
        assert_eq!(redact_url("redis://redis:6379/0"), "redis://redis:6379/0");
    }
}
