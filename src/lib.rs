//! Concurrent task-execution core.
//!
//! Units of work are opaque async closures submitted as [`Task`]s to the
//! [`ParallelTaskExecutor`] (batch runs over a dependency DAG, with
//! fractional resource admission and circuit-breaker fault isolation) or
//! to the continuously running [`TaskQueue`] / [`TaskScheduler`].

pub mod config;
pub mod core;
pub mod error;
pub mod exec;
pub mod queue;

pub use config::Config;
pub use self::core::graph::DependencyGraph;
pub use self::core::task::{work_fn, RetryPolicy, Task, TaskId, TaskStatus, WorkFn, WorkFuture};
pub use error::{Error, ErrorKind, Result};
pub use exec::breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
};
pub use exec::executor::{ExecutorEvent, ParallelTaskExecutor, TaskMetrics};
pub use exec::resources::{ResourcePool, ResourceRequirement, ResourceType};
pub use queue::queue::{QueueStats, TaskQueue};
pub use queue::scheduler::{Schedule, ScheduledTask, TaskScheduler};
