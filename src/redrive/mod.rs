//! Redrive: backoff, execution-engine port, the redrive engine and recommendations.

pub mod backoff;
pub mod engine;
pub mod executor;
pub mod recommend;

pub use backoff::BackoffPolicy;
pub use engine::{
    is_eligible, AutoRedriveStats, BulkRedriveResult, RedriveEngine, RedriveOptions,
    RedriveOutcome,
};
pub use executor::{DispatchResult, ExecutionRequest, RedisTaskDispatcher, TaskExecutor};
pub use recommend::{recommend, Recommendation};
