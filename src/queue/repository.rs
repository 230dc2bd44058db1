//! DLQ repository contract and the query types it accepts.

use std::cmp::Ordering;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{DlqEntry, DlqPriority, DlqStatus, ErrorCategory};
use super::stats::DlqStats;
use crate::error::StorageError;

/// Largest page a single `list` call returns.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Persistence for DLQ entries.
///
/// Implementations must keep `task_id` unique and make
/// [`DlqRepository::update_if_status`] an atomic check-and-set.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DlqRepository: Send + Sync {
    /// Persists a new entry. Fails with `DuplicateTaskId` if the task is already captured.
    async fn create(&self, entry: &DlqEntry) -> Result<(), StorageError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<DlqEntry>, StorageError>;

    async fn get_by_task_id(&self, task_id: &str) -> Result<Option<DlqEntry>, StorageError>;

    /// Returns one page of entries matching the query plus the total match count.
    async fn list(&self, query: &ListQuery) -> Result<Page, StorageError>;

    /// Replaces a stored entry. Fails with `NotFound` if it does not exist.
    async fn update(&self, entry: &DlqEntry) -> Result<(), StorageError>;

    /// Replaces a stored entry only if its stored status is still `expected`.
    ///
    /// Returns false, leaving storage untouched, when another writer got there first.
    async fn update_if_status(
        &self,
        entry: &DlqEntry,
        expected: DlqStatus,
    ) -> Result<bool, StorageError>;

    /// Replaces a stored entry only if it is still the version `observed` was
    /// read from: same status and same `updated_at`.
    ///
    /// Returns false, leaving storage untouched, when the entry moved on.
    async fn update_if_unchanged(
        &self,
        entry: &DlqEntry,
        observed: &DlqEntry,
    ) -> Result<bool, StorageError>;

    /// Deletes an entry, returning whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// Aggregate statistics over entries created in the trailing `days`.
    async fn stats(&self, days: u32) -> Result<DlqStats, StorageError>;

    /// Deletes entries older than `older_than_days`, optionally only those in `status`.
    async fn cleanup(
        &self,
        older_than_days: u32,
        status: Option<DlqStatus>,
    ) -> Result<usize, StorageError>;

    /// Pending entries with retries left whose backoff has elapsed, highest
    /// priority first and oldest first within a priority. Categories that need
    /// a manual data fix are never returned.
    async fn entries_ready_for_retry(
        &self,
        batch_size: usize,
    ) -> Result<Vec<DlqEntry>, StorageError>;
}

/// Bounds a storage call so a stuck backend cannot stall its caller.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            seconds: timeout.as_secs(),
        }),
    }
}

/// Filters for listing entries. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    pub status: Option<DlqStatus>,
    pub category: Option<ErrorCategory>,
    pub priority: Option<DlqPriority>,
    /// Case-insensitive substring of the task name.
    pub task_name: Option<String>,
    pub correlated_entity_id: Option<String>,
    pub queue_name: Option<String>,
    pub worker_name: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ListFilter {
    /// Returns true if the entry satisfies every set filter.
    pub fn matches(&self, entry: &DlqEntry) -> bool {
        if self.status.is_some_and(|s| s != entry.status) {
            return false;
        }
        if self.category.is_some_and(|c| c != entry.error_category) {
            return false;
        }
        if self.priority.is_some_and(|p| p != entry.priority) {
            return false;
        }
        if let Some(name) = &self.task_name {
            if !entry
                .task_name
                .to_lowercase()
                .contains(&name.to_lowercase())
            {
                return false;
            }
        }
        if !option_matches(&self.correlated_entity_id, &entry.correlated_entity_id)
            || !option_matches(&self.queue_name, &entry.queue_name)
            || !option_matches(&self.worker_name, &entry.worker_name)
            || !option_matches(&self.idempotency_key, &entry.idempotency_key)
        {
            return false;
        }
        if self.created_after.is_some_and(|t| entry.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| entry.created_at > t) {
            return false;
        }
        true
    }
}

fn option_matches(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted {
        Some(w) => actual.as_deref() == Some(w.as_str()),
        None => true,
    }
}

/// Field to order a listing by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
    RetryCount,
    NextRetryAt,
    TaskName,
}

impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created_at" => Ok(SortBy::CreatedAt),
            "updated_at" => Ok(SortBy::UpdatedAt),
            "priority" => Ok(SortBy::Priority),
            "retry_count" => Ok(SortBy::RetryCount),
            "next_retry_at" => Ok(SortBy::NextRetryAt),
            "task_name" => Ok(SortBy::TaskName),
            other => Err(format!("unknown sort field '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

/// A filtered, sorted, paginated listing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListQuery {
    pub filter: ListFilter,
    /// 1-indexed page number.
    pub page: usize,
    pub page_size: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: ListFilter::default(),
            page: 1,
            page_size: 50,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl ListQuery {
    /// Page number clamped to at least 1.
    pub fn page(&self) -> usize {
        self.page.max(1)
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Number of matching entries to skip.
    pub fn offset(&self) -> usize {
        (self.page() - 1).saturating_mul(self.page_size())
    }

    /// Filters, sorts and paginates an in-process candidate set.
    pub fn apply(&self, entries: impl IntoIterator<Item = DlqEntry>) -> Page {
        let mut matched: Vec<DlqEntry> = entries
            .into_iter()
            .filter(|e| self.filter.matches(e))
            .collect();

        matched.sort_by(|a, b| {
            let ordering = compare_by(self.sort_by, a, b);
            match self.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matched.len();
        let entries = matched
            .into_iter()
            .skip(self.offset())
            .take(self.page_size())
            .collect();

        Page {
            entries,
            total,
            page: self.page(),
            page_size: self.page_size(),
        }
    }
}

fn compare_by(sort_by: SortBy, a: &DlqEntry, b: &DlqEntry) -> Ordering {
    let primary = match sort_by {
        SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
        SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortBy::Priority => a.priority.cmp(&b.priority),
        SortBy::RetryCount => a.retry_count.cmp(&b.retry_count),
        SortBy::NextRetryAt => a.next_retry_at.cmp(&b.next_retry_at),
        SortBy::TaskName => a.task_name.cmp(&b.task_name),
    };
    // Stable tiebreak keeps pagination deterministic.
    primary.then_with(|| a.id.cmp(&b.id))
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub entries: Vec<DlqEntry>,
    /// Number of entries matching the filter across all pages.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Selects entries ready for an automatic retry from an in-process candidate set.
///
/// Entries needing manual correction are left out so they cannot fill every
/// batch ahead of redrivable ones.
pub fn select_ready_for_retry(
    entries: impl IntoIterator<Item = DlqEntry>,
    now: DateTime<Utc>,
    batch_size: usize,
) -> Vec<DlqEntry> {
    let mut ready: Vec<DlqEntry> = entries
        .into_iter()
        .filter(|e| {
            e.status == DlqStatus::Pending
                && e.retry_count < e.max_retries
                && e.next_retry_at.map_or(true, |t| t <= now)
                && !e.error_category.requires_manual_correction()
        })
        .collect();

    ready.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    ready.truncate(batch_size);
    ready
}
