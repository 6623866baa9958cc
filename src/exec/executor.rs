//! Dependency-aware parallel task execution.
//!
//! The [`ParallelTaskExecutor`] composes the dependency graph, resource
//! pool, and circuit breakers to run a task set under a concurrency cap.
//! Callers add tasks (metadata plus an opaque work closure), then drive
//! the batch with [`ParallelTaskExecutor::execute_all`], which admits
//! ready tasks in priority order, races each attempt against its timeout
//! and cancellation token, and unlocks dependents as tasks complete.

use crate::core::graph::DependencyGraph;
use crate::core::task::{RetryPolicy, Task, TaskId, TaskStatus, WorkFn};
use crate::error::{Error, ErrorKind, Result};
use crate::exec::breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitBreaker};
use crate::exec::resources::ResourcePool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often to re-check a contended pool when nothing local is running.
const RESOURCE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle events emitted during a batch run.
///
/// Delivered over the channel returned by
/// [`ParallelTaskExecutor::subscribe`] so observers need not poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ExecutorEvent {
    /// A task was admitted and began executing.
    TaskStarted { id: TaskId },
    /// A task finished successfully.
    TaskCompleted { id: TaskId },
    /// A task failed terminally (error, timeout, or circuit rejection).
    TaskFailed { id: TaskId, error: String },
    /// A task was cancelled before or during execution.
    TaskCancelled { id: TaskId, reason: String },
    /// The batch run finished; no more events follow.
    AllTasksComplete {
        completed: usize,
        failed: usize,
        cancelled: usize,
    },
}

/// Counts of tasks by status, for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct TaskRecord {
    task: Task,
    work: WorkFn,
    /// Insertion order, the tie-break after priority.
    seq: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ExecutorInner {
    records: HashMap<TaskId, TaskRecord>,
    graph: DependencyGraph,
    next_seq: u64,
}

/// Bounded-concurrency executor over a task DAG.
///
/// Shared state (task records, graph) sits behind one mutex with short
/// critical sections; the pool and breaker registry serialize their own
/// mutations. One batch run at a time: `execute_all` is the single
/// coordinator and spawned task bodies only report back over a channel.
pub struct ParallelTaskExecutor {
    max_concurrency: usize,
    inner: Mutex<ExecutorInner>,
    pool: Arc<ResourcePool>,
    registry: Arc<BreakerRegistry>,
    events: Mutex<Option<mpsc::UnboundedSender<ExecutorEvent>>>,
}

impl ParallelTaskExecutor {
    /// Create an executor with the given concurrency cap (minimum 1),
    /// a fresh resource pool, and a fresh breaker registry.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            inner: Mutex::new(ExecutorInner::default()),
            pool: Arc::new(ResourcePool::new()),
            registry: Arc::new(BreakerRegistry::new()),
            events: Mutex::new(None),
        }
    }

    /// Use a shared resource pool.
    pub fn with_pool(mut self, pool: Arc<ResourcePool>) -> Self {
        self.pool = pool;
        self
    }

    /// Use a shared breaker registry.
    pub fn with_registry(mut self, registry: Arc<BreakerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// The executor's resource pool.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// The executor's breaker registry.
    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    /// Register (or fetch) a named circuit breaker.
    pub fn add_breaker(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        self.registry.register(name, config)
    }

    /// Snapshot every registered circuit breaker.
    pub fn breaker_snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        self.registry.snapshots()
    }

    /// Subscribe to lifecycle events. Replaces any previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().expect("executor events lock poisoned") = Some(tx);
        rx
    }

    fn emit(&self, event: ExecutorEvent) {
        let guard = self.events.lock().expect("executor events lock poisoned");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Add a task and its work closure.
    ///
    /// Validated synchronously: resource amounts must be finite fractions
    /// in `[0, 1]`, the id must be unique, and every dependency must name
    /// an already-added task (which also rules out cycles).
    pub fn add_task(&self, task: Task, work: WorkFn) -> Result<()> {
        for req in &task.resources {
            if !req.amount.is_finite() || req.amount < 0.0 || req.amount > 1.0 {
                return Err(Error::Validation(format!(
                    "invalid resource amount {} for {}",
                    req.amount, req.resource
                )));
            }
        }

        let mut inner = self.inner.lock().expect("executor lock poisoned");
        if inner.records.contains_key(&task.id) {
            return Err(Error::Validation(format!("duplicate task id: {}", task.id)));
        }
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(Error::Validation(format!(
                    "task {} cannot depend on itself",
                    task.id
                )));
            }
            if !inner.records.contains_key(dep) {
                return Err(Error::Validation(format!(
                    "unknown dependency {} for task {}",
                    dep, task.id
                )));
            }
        }

        inner.graph.add_node(&task.id);
        for dep in &task.dependencies {
            inner.graph.add_dependency(&task.id, dep)?;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(task = %task.id, priority = task.priority, "task added");
        inner.records.insert(
            task.id.clone(),
            TaskRecord {
                task,
                work,
                seq,
                token: CancellationToken::new(),
            },
        );
        Ok(())
    }

    /// Snapshot of a task's metadata and status.
    pub fn get_task(&self, id: &TaskId) -> Option<Task> {
        let inner = self.inner.lock().expect("executor lock poisoned");
        inner.records.get(id).map(|r| r.task.clone())
    }

    /// The cancellation token a running task's work can observe.
    pub fn cancellation_token(&self, id: &TaskId) -> Option<CancellationToken> {
        let inner = self.inner.lock().expect("executor lock poisoned");
        inner.records.get(id).map(|r| r.token.clone())
    }

    /// Counts of tasks by status.
    pub fn get_task_metrics(&self) -> TaskMetrics {
        let inner = self.inner.lock().expect("executor lock poisoned");
        let mut metrics = TaskMetrics {
            total: inner.records.len(),
            ..Default::default()
        };
        for record in inner.records.values() {
            match record.task.status {
                TaskStatus::Pending => metrics.pending += 1,
                TaskStatus::Running => metrics.running += 1,
                TaskStatus::Completed => metrics.completed += 1,
                TaskStatus::Failed { .. } => metrics.failed += 1,
                TaskStatus::Cancelled { .. } => metrics.cancelled += 1,
            }
        }
        metrics
    }

    /// Cancel a task, optionally cascading to everything that depends on it.
    ///
    /// A pending task is marked cancelled immediately. A running task gets
    /// its token cancelled and finishes cooperatively; its dependents are
    /// blocked either way because a cancelled task never completes.
    /// Returns false if the task is unknown or already terminal.
    pub fn cancel_task(&self, id: &TaskId, cancel_dependents: bool) -> bool {
        let mut to_emit = Vec::new();
        {
            let mut inner = self.inner.lock().expect("executor lock poisoned");
            {
                let Some(record) = inner.records.get_mut(id) else {
                    return false;
                };
                if record.task.is_terminal() {
                    return false;
                }
                record.token.cancel();
                if record.task.status != TaskStatus::Running {
                    record.task.cancel("cancelled by caller");
                    to_emit.push(ExecutorEvent::TaskCancelled {
                        id: id.clone(),
                        reason: "cancelled by caller".to_string(),
                    });
                }
            }
            if cancel_dependents {
                let dependents = inner.graph.transitive_dependents(id);
                for dep_id in dependents {
                    let Some(record) = inner.records.get_mut(&dep_id) else {
                        continue;
                    };
                    if record.task.is_terminal() {
                        continue;
                    }
                    record.token.cancel();
                    if record.task.status != TaskStatus::Running {
                        record.task.cancel("dependency cancelled");
                        to_emit.push(ExecutorEvent::TaskCancelled {
                            id: dep_id.clone(),
                            reason: "dependency cancelled".to_string(),
                        });
                    }
                }
            }
        }
        info!(task = %id, cascade = cancel_dependents, "task cancelled");
        for event in to_emit {
            self.emit(event);
        }
        true
    }

    /// Run every added task to a terminal state, respecting dependencies,
    /// resources, breakers, and the concurrency cap.
    ///
    /// Returns the map of completed results when no task failed (cancelled
    /// and residual-pending tasks are excluded from the map). If any task
    /// failed, the first failure is returned as the batch error once no
    /// further progress is possible; siblings already running are not
    /// interrupted.
    pub async fn execute_all(&self) -> Result<HashMap<TaskId, Value>> {
        {
            let inner = self.inner.lock().expect("executor lock poisoned");
            if inner.graph.has_cycle() {
                return Err(Error::Validation(
                    "dependency graph contains a cycle".to_string(),
                ));
            }
        }

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut results = HashMap::new();
        let mut first_error = None;

        loop {
            let (admitted, resource_wait) = self.admission_pass(&done_tx, &mut first_error);
            if admitted == 0 && self.running_count() == 0 {
                // A shared pool may be drained by another holder; poll as
                // long as a ready task could still fit an emptied pool.
                if resource_wait {
                    tokio::time::sleep(RESOURCE_POLL_INTERVAL).await;
                    continue;
                }
                break;
            }
            if self.running_count() > 0 {
                // done_tx is held locally, so recv cannot return None here
                if let Some((id, outcome)) = done_rx.recv().await {
                    self.handle_completion(&id, outcome, &mut results, &mut first_error);
                }
            }
        }

        let metrics = self.get_task_metrics();
        info!(
            completed = metrics.completed,
            failed = metrics.failed,
            cancelled = metrics.cancelled,
            pending = metrics.pending,
            "batch run finished"
        );
        self.emit(ExecutorEvent::AllTasksComplete {
            completed: metrics.completed,
            failed: metrics.failed,
            cancelled: metrics.cancelled,
        });

        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    fn running_count(&self) -> usize {
        let inner = self.inner.lock().expect("executor lock poisoned");
        inner
            .records
            .values()
            .filter(|r| r.task.status == TaskStatus::Running)
            .count()
    }

    /// One admission pass over the ready set, in priority order with
    /// insertion-order ties. Returns how many tasks were started, plus
    /// whether any candidate was held back only by resources it could
    /// fit into an empty pool (so waiting can make progress).
    fn admission_pass(
        &self,
        done_tx: &mpsc::UnboundedSender<(TaskId, Result<Value>)>,
        first_error: &mut Option<Error>,
    ) -> (usize, bool) {
        let candidates = {
            let inner = self.inner.lock().expect("executor lock poisoned");
            let completed: HashSet<TaskId> = inner
                .records
                .values()
                .filter(|r| r.task.status == TaskStatus::Completed)
                .map(|r| r.task.id.clone())
                .collect();
            let mut candidates: Vec<(i64, u64, TaskId)> = inner
                .graph
                .ready_tasks(&completed)
                .into_iter()
                .filter_map(|id| {
                    let record = inner.records.get(&id)?;
                    (record.task.can_start() && !record.token.is_cancelled())
                        .then(|| (record.task.priority, record.seq, id))
                })
                .collect();
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            candidates
        };

        let mut admitted = 0;
        let mut resource_wait = false;
        for (_, _, id) in candidates {
            if self.running_count() >= self.max_concurrency {
                break;
            }

            let snapshot = {
                let inner = self.inner.lock().expect("executor lock poisoned");
                inner
                    .records
                    .get(&id)
                    .filter(|r| r.task.can_start() && !r.token.is_cancelled())
                    .map(|r| {
                        (
                            r.work.clone(),
                            r.token.clone(),
                            r.task.timeout,
                            r.task.retry,
                            r.task.resources.clone(),
                            r.task.breaker.clone(),
                        )
                    })
            };
            let Some((work, token, timeout, retry, resources, breaker_name)) = snapshot else {
                continue;
            };

            // Resource shortage is not terminal: the task stays pending
            // for a later pass once something releases. Allocation comes
            // before the breaker consult, which counts calls; a denied
            // pass must leave the breaker untouched.
            if !self.pool.allocate(&id, &resources) {
                debug!(task = %id, "resources unavailable, staying pending");
                if self.pool.is_satisfiable(&resources) {
                    resource_wait = true;
                }
                continue;
            }

            if let Some(name) = &breaker_name {
                let breaker = self.registry.register(name, BreakerConfig::default());
                if !breaker.allow_request() {
                    self.pool.release(&id);
                    let err = Error::CircuitOpen {
                        breaker: name.clone(),
                        snapshot: breaker.snapshot(),
                    };
                    let message = err.to_string();
                    {
                        let mut inner = self.inner.lock().expect("executor lock poisoned");
                        if let Some(record) = inner.records.get_mut(&id) {
                            record.task.fail(&message);
                        }
                    }
                    warn!(task = %id, breaker = %name, "admission rejected: circuit open");
                    self.emit(ExecutorEvent::TaskFailed {
                        id: id.clone(),
                        error: message,
                    });
                    first_error.get_or_insert(err);
                    continue;
                }
            }

            let started = {
                let mut inner = self.inner.lock().expect("executor lock poisoned");
                match inner.records.get_mut(&id) {
                    Some(record) if record.task.can_start() && !record.token.is_cancelled() => {
                        record.task.start();
                        true
                    }
                    _ => false,
                }
            };
            if !started {
                self.pool.release(&id);
                continue;
            }

            info!(task = %id, "task started");
            self.emit(ExecutorEvent::TaskStarted { id: id.clone() });

            let tx = done_tx.clone();
            let task_id = id.clone();
            tokio::spawn(async move {
                let outcome = drive_attempts(task_id.clone(), work, timeout, retry, token).await;
                let _ = tx.send((task_id, outcome));
            });
            admitted += 1;
        }
        (admitted, resource_wait)
    }

    fn handle_completion(
        &self,
        id: &TaskId,
        outcome: Result<Value>,
        results: &mut HashMap<TaskId, Value>,
        first_error: &mut Option<Error>,
    ) {
        let freed = self.pool.release(id);
        if !freed.is_empty() {
            debug!(task = %id, types = freed.len(), "resources returned to pool");
        }

        let breaker = {
            let inner = self.inner.lock().expect("executor lock poisoned");
            inner
                .records
                .get(id)
                .and_then(|r| r.task.breaker.as_deref().and_then(|n| self.registry.get(n)))
        };

        match outcome {
            Ok(value) => {
                if let Some(breaker) = breaker {
                    breaker.record_success();
                }
                {
                    let mut inner = self.inner.lock().expect("executor lock poisoned");
                    if let Some(record) = inner.records.get_mut(id) {
                        record.task.complete(value.clone());
                    }
                }
                results.insert(id.clone(), value);
                info!(task = %id, "task completed");
                self.emit(ExecutorEvent::TaskCompleted { id: id.clone() });
            }
            Err(Error::Cancelled { reason, .. }) => {
                // Cancellation does not feed the breaker or fail the batch
                {
                    let mut inner = self.inner.lock().expect("executor lock poisoned");
                    if let Some(record) = inner.records.get_mut(id) {
                        record.task.cancel(&reason);
                    }
                }
                info!(task = %id, %reason, "task cancelled during execution");
                self.emit(ExecutorEvent::TaskCancelled {
                    id: id.clone(),
                    reason,
                });
            }
            Err(err) => {
                if let Some(breaker) = breaker {
                    breaker.record_failure(&err);
                }
                let message = err.to_string();
                {
                    let mut inner = self.inner.lock().expect("executor lock poisoned");
                    if let Some(record) = inner.records.get_mut(id) {
                        record.task.fail(&message);
                    }
                }
                warn!(task = %id, error = %message, "task failed");
                self.emit(ExecutorEvent::TaskFailed {
                    id: id.clone(),
                    error: message,
                });
                first_error.get_or_insert(err);
            }
        }
    }
}

impl std::fmt::Debug for ParallelTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("executor lock poisoned");
        f.debug_struct("ParallelTaskExecutor")
            .field("max_concurrency", &self.max_concurrency)
            .field("tasks", &inner.records.len())
            .finish()
    }
}

/// Run one task through its retry policy, racing each attempt against the
/// per-attempt timeout and the cancellation token.
///
/// Every attempt invokes the work closure afresh. A timeout is terminal
/// and consumes no retries; other errors retry after the policy's delay
/// until attempts are exhausted.
pub(crate) async fn drive_attempts(
    id: TaskId,
    work: WorkFn,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    token: CancellationToken,
) -> Result<Value> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let fut = work();
        let timeout_id = id.clone();
        let attempt_result = tokio::select! {
            _ = token.cancelled() => {
                return Err(Error::Cancelled {
                    task_id: id,
                    reason: "cancelled during execution".to_string(),
                });
            }
            result = async {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(inner) => inner,
                        Err(_) => Err(Error::Timeout {
                            task_id: timeout_id,
                            timeout: limit,
                        }),
                    },
                    None => fut.await,
                }
            } => result,
        };

        match attempt_result {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == ErrorKind::Timeout => return Err(err),
            Err(err) if attempt < retry.attempts() => {
                debug!(task = %id, attempt, error = %err, "attempt failed, retrying");
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(Error::Cancelled {
                            task_id: id,
                            reason: "cancelled between retries".to_string(),
                        });
                    }
                    _ = tokio::time::sleep(retry.delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
