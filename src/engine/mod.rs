//! Execution engine for workflows.
//!
//! [`Engine`] ties the pieces together: the [`Executor`] runs single node
//! attempts, [`RetryManager`] and [`CircuitBreakerManager`] wrap them, and
//! the [`WorkerPool`] bounds how many nodes run at once.

mod circuit_breaker;
mod executor;
mod pool;
mod retry;
mod runner;

pub use circuit_breaker::{
    node_key, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState, Counts,
    ReadyToTrip, StateChangeHook,
};
pub use executor::Executor;
pub use pool::{Job, JobResult, JobTask, PoolConfig, PoolStats, WorkerPool};
pub use retry::{
    BackoffStrategy, BackoffType, RetryCondition, RetryManager, RetryStrategy, DEFAULT_STRATEGY,
};
pub use runner::{Engine, ExecuteOptions};
