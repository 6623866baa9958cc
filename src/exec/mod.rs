//! Execution layer: resource admission, fault isolation, and the
//! dependency-aware parallel executor.

pub mod breaker;
pub mod executor;
pub mod resources;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use executor::{ExecutorEvent, ParallelTaskExecutor, TaskMetrics};
pub use resources::{ResourcePool, ResourceRequirement, ResourceType};
