//! Core data structures: tasks and the dependency graph.

pub mod graph;
pub mod task;

pub use graph::DependencyGraph;
pub use task::{work_fn, RetryPolicy, Task, TaskId, TaskStatus, WorkFn, WorkFuture};
