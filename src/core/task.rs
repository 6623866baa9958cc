//! Task data model for the execution core.
//!
//! Tasks are the atomic units of work submitted to the executor or queue.
//! Each task tracks its status, priority, retry/timeout policy, dependencies,
//! resource requirements, and results. The work itself is an opaque async
//! closure ([`WorkFn`]) stored separately from the serializable metadata.

use crate::error::Result;
use crate::exec::resources::ResourceRequirement;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Backed by a string so callers may supply their own ids (e.g. a scheduler
/// tagging runs as `"{id}_run_{n}"`); generated ids are UUID v4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new unique task identifier (UUID v4).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Return the first 8 characters of the id for display.
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The future returned by one invocation of a task's work closure.
pub type WorkFuture = BoxFuture<'static, Result<Value>>;

/// An opaque unit of work.
///
/// Invoked once per attempt, so retries re-run the closure from the start.
/// Kept out of [`Task`] because closures are neither serializable nor
/// meaningfully debuggable; the executor and queue key them by [`TaskId`].
pub type WorkFn = Arc<dyn Fn() -> WorkFuture + Send + Sync>;

/// Wrap an async closure as a [`WorkFn`].
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but not yet admitted.
    Pending,
    /// Task is currently executing.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task was cancelled before or during execution.
    Cancelled {
        /// Why the task was cancelled.
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Whether this is a terminal state (Completed, Failed, or Cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled { .. }
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Cancelled { reason } => write!(f, "cancelled: {}", reason),
        }
    }
}

/// Retry policy for a single task.
///
/// Retries are local to one task; exhausting them is a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy.
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Total number of attempts this policy allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// A single task in the execution core.
///
/// Holds the serializable metadata only; the work closure lives alongside,
/// keyed by id. Owned exclusively by the queue/executor that created it
/// until it reaches a terminal state. `result` and `error` are write-once:
/// they are set exactly at the terminal transition and never mutated after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Optional human-readable description for progress reporting.
    pub description: Option<String>,
    /// Priority; higher runs first. Ties break by insertion order.
    pub priority: i64,
    /// Current execution status.
    pub status: TaskStatus,
    /// Optional per-attempt execution bound.
    pub timeout: Option<Duration>,
    /// Retry policy applied on failure.
    pub retry: RetryPolicy,
    /// Ids of tasks that must reach Completed before this one starts.
    pub dependencies: HashSet<TaskId>,
    /// Name of the circuit breaker guarding this task, if any.
    pub breaker: Option<String>,
    /// Fractional resource claims required to run.
    pub resources: Vec<ResourceRequirement>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result value on success.
    pub result: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
    /// Optional step count for progress reporting.
    pub total_steps: Option<u32>,
}

impl Task {
    /// Create a new pending task with the given id.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            description: None,
            priority: 0,
            status: TaskStatus::Pending,
            timeout: None,
            retry: RetryPolicy::default(),
            dependencies: HashSet::new(),
            breaker: None,
            resources: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            total_steps: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Add a dependency on another task.
    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Attach a named circuit breaker.
    pub fn with_breaker(mut self, name: &str) -> Self {
        self.breaker = Some(name.to_string());
        self
    }

    /// Add a resource requirement.
    pub fn with_resource(mut self, req: ResourceRequirement) -> Self {
        self.resources.push(req);
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Start the task: transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task completed with its result value.
    ///
    /// No-op if the task is already terminal (write-once).
    pub fn complete(&mut self, result: Value) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task failed with an error message.
    ///
    /// No-op if the task is already terminal (write-once).
    pub fn fail(&mut self, error: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task cancelled with a reason.
    ///
    /// No-op if the task is already terminal.
    pub fn cancel(&mut self, reason: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Cancelled {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task can be admitted (still Pending).
    pub fn can_start(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}
