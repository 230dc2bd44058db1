//! In-process DLQ repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use super::entry::{DlqEntry, DlqStatus};
use super::repository::{select_ready_for_retry, DlqRepository, ListQuery, Page};
use super::stats::DlqStats;
use crate::error::StorageError;

#[derive(Default)]
struct Tables {
    entries: HashMap<String, DlqEntry>,
    /// task_id -> entry id
    by_task: HashMap<String, String>,
}

/// Repository keeping entries in memory. Used for tests and dry runs.
#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.tables.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DlqRepository for InMemoryRepository {
    async fn create(&self, entry: &DlqEntry) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        if tables.by_task.contains_key(&entry.task_id) {
            return Err(StorageError::DuplicateTaskId {
                task_id: entry.task_id.clone(),
            });
        }
        tables
            .by_task
            .insert(entry.task_id.clone(), entry.id.clone());
        tables.entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<DlqEntry>, StorageError> {
        Ok(self.tables.read().await.entries.get(id).cloned())
    }

    async fn get_by_task_id(&self, task_id: &str) -> Result<Option<DlqEntry>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_task
            .get(task_id)
            .and_then(|id| tables.entries.get(id))
            .cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Page, StorageError> {
        let tables = self.tables.read().await;
        Ok(query.apply(tables.entries.values().cloned()))
    }

    async fn update(&self, entry: &DlqEntry) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        match tables.entries.get_mut(&entry.id) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
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
        let mut tables = self.tables.write().await;
        match tables.entries.get_mut(&entry.id) {
            Some(stored) if stored.status == expected => {
                *stored = entry.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound {
                id: entry.id.clone(),
            }),
        }
    }

    async fn update_if_unchanged(
        &self,
        entry: &DlqEntry,
        observed: &DlqEntry,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        match tables.entries.get_mut(&entry.id) {
            Some(stored)
                if stored.status == observed.status && stored.updated_at == observed.updated_at =>
            {
                *stored = entry.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound {
                id: entry.id.clone(),
            }),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        match tables.entries.remove(id) {
            Some(entry) => {
                tables.by_task.remove(&entry.task_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self, days: u32) -> Result<DlqStats, StorageError> {
        let tables = self.tables.read().await;
        Ok(DlqStats::from_entries(
            tables.entries.values(),
            days,
            Utc::now(),
        ))
    }

    async fn cleanup(
        &self,
        older_than_days: u32,
        status: Option<DlqStatus>,
    ) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let mut tables = self.tables.write().await;

        let doomed: Vec<(String, String)> = tables
            .entries
            .values()
            .filter(|e| e.created_at < cutoff && status.map_or(true, |s| e.status == s))
            .map(|e| (e.id.clone(), e.task_id.clone()))
            .collect();

        for (id, task_id) in &doomed {
            tables.entries.remove(id);
            tables.by_task.remove(task_id);
        }

        Ok(doomed.len())
    }

    async fn entries_ready_for_retry(
        &self,
        batch_size: usize,
    ) -> Result<Vec<DlqEntry>, StorageError> {
        let tables = self.tables.read().await;
        Ok(select_ready_for_retry(
            tables.entries.values().cloned(),
            Utc::now(),
            batch_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::entry::DlqPriority;
    use tokio_test::{assert_err, assert_ok};

    fn entry(task_id: &str) -> DlqEntry {
        DlqEntry::new(task_id, "process_invoice", "ValueError", "bad total")
    }

    #[tokio::test]
    async fn test_task_id_is_unique() {
        let repo = InMemoryRepository::new();
        assert_ok!(repo.create(&entry("t-1")).await);

        let duplicate = repo.create(&entry("t-1")).await;
        assert!(matches!(
            duplicate,
            Err(StorageError::DuplicateTaskId { task_id }) if task_id == "t-1"
        ));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_task_id() {
        let repo = InMemoryRepository::new();
        let e = entry("t-1");
        repo.create(&e).await.unwrap();

        assert_eq!(repo.get_by_id(&e.id).await.unwrap(), Some(e.clone()));
        assert_eq!(repo.get_by_task_id("t-1").await.unwrap(), Some(e));
        assert_eq!(repo.get_by_task_id("t-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_conditional_update_rejects_stale_status() {
        let repo = InMemoryRepository::new();
        let mut e = entry("t-1");
        repo.create(&e).await.unwrap();

        e.begin_attempt(Utc::now());
        assert!(repo.update_if_status(&e, DlqStatus::Pending).await.unwrap());
        // Second writer still believes the entry is pending.
        assert!(!repo.update_if_status(&e, DlqStatus::Pending).await.unwrap());

        let stored = repo.get_by_id(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DlqStatus::Processing);
    }

    #[tokio::test]
    async fn test_unchanged_check_catches_a_round_trip_through_processing() {
        let repo = InMemoryRepository::new();
        let e = entry("t-1");
        repo.create(&e).await.unwrap();
        let observed = repo.get_by_id(&e.id).await.unwrap().unwrap();

        // Another writer claims the entry and puts it back to pending.
        let mut moved = observed.clone();
        moved.begin_attempt(Utc::now() + Duration::seconds(1));
        assert!(repo.update_if_status(&moved, DlqStatus::Pending).await.unwrap());
        moved.status = DlqStatus::Pending;
        moved.updated_at = Utc::now() + Duration::seconds(2);
        repo.update(&moved).await.unwrap();

        let mut stale = observed.clone();
        stale.error_message = "late signal".to_string();
        assert!(!repo.update_if_unchanged(&stale, &observed).await.unwrap());

        let current = repo.get_by_id(&e.id).await.unwrap().unwrap();
        assert!(repo.update_if_unchanged(&current, &current).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_missing_entry_fails() {
        let repo = InMemoryRepository::new();
        assert_err!(repo.update(&entry("ghost")).await);
    }

    #[tokio::test]
    async fn test_cleanup_respects_age_and_status() {
        let repo = InMemoryRepository::new();
        let mut old_done = entry("old-done");
        old_done.status = DlqStatus::Completed;
        old_done.created_at = Utc::now() - Duration::days(40);
        let mut old_pending = entry("old-pending");
        old_pending.created_at = Utc::now() - Duration::days(40);
        let fresh = entry("fresh");

        for e in [&old_done, &old_pending, &fresh] {
            repo.create(e).await.unwrap();
        }

        let deleted = repo.cleanup(30, Some(DlqStatus::Completed)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.get_by_task_id("old-done").await.unwrap().is_none());

        let deleted = repo.cleanup(30, None).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.len().await, 1);
        // Task id is free again once its entry is gone.
        assert_ok!(repo.create(&entry("old-pending")).await);
    }

    #[tokio::test]
    async fn test_ready_for_retry_prefers_critical() {
        let repo = InMemoryRepository::new();
        let mut normal = entry("normal");
        normal.created_at = Utc::now() - Duration::hours(3);
        let mut critical = entry("critical");
        critical.priority = DlqPriority::Critical;
        repo.create(&normal).await.unwrap();
        repo.create(&critical).await.unwrap();

        let ready = repo.entries_ready_for_retry(10).await.unwrap();
        assert_eq!(ready[0].task_id, "critical");
        assert_eq!(ready[1].task_id, "normal");
    }
}
