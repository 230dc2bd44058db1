//! Dead letter queue storage: entry model, repository contract and backends.

pub mod entry;
pub mod memory;
pub mod redis;
pub mod repository;
pub mod stats;

pub use entry::{DlqEntry, DlqPriority, DlqStatus, ErrorCategory, RedriveAttempt};
pub use memory::InMemoryRepository;
pub use redis::RedisRepository;
pub use repository::{DlqRepository, ListFilter, ListQuery, Page, SortBy, SortOrder};
pub use stats::DlqStats;
