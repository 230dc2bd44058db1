//! Circuit breakers that stop redrives against a failing downstream.

pub mod registry;
pub mod state;

pub use registry::{
    BreakerPolicy, BreakerRegistry, BreakerSnapshot, LocalBreakerRegistry, RedisBreakerRegistry,
};
pub use state::{BreakerSettings, CircuitBreaker, CircuitState, TaskBucket};
