//! Priority-ordered task queue with a background worker.
//!
//! Unlike the batch-oriented executor, the [`TaskQueue`] accepts work
//! continuously: a spawned worker loop drains pending tasks in priority
//! order under the queue's own concurrency cap, and callers can suspend
//! on [`TaskQueue::wait_for_task`] until a task reaches a terminal state.

use crate::core::task::{Task, TaskId, TaskStatus, WorkFn};
use crate::error::{Error, Result};
use crate::exec::executor::drive_attempts;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts of queued tasks by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct QueueRecord {
    task: Task,
    work: WorkFn,
    seq: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueInner {
    records: HashMap<TaskId, QueueRecord>,
    next_seq: u64,
}

/// Continuously running, priority-ordered task queue.
///
/// Must be created inside a tokio runtime: `new` spawns the worker loop.
/// Shutdown is graceful: no new admissions, but already-running tasks
/// finish and have their completions recorded.
pub struct TaskQueue {
    max_concurrency: usize,
    inner: Mutex<QueueInner>,
    /// Wakes the worker when new work arrives. Single worker, so the
    /// stored-permit semantics of `notify_one` avoid lost wakeups.
    worker_wake: Notify,
    /// Wakes `wait_for_task` callers on any terminal transition.
    done_wake: Notify,
    shutdown_token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create a queue and spawn its worker loop.
    pub fn new(max_concurrency: usize) -> Arc<Self> {
        let queue = Arc::new(Self {
            max_concurrency: max_concurrency.max(1),
            inner: Mutex::new(QueueInner::default()),
            worker_wake: Notify::new(),
            done_wake: Notify::new(),
            shutdown_token: CancellationToken::new(),
            worker: Mutex::new(None),
        });
        let handle = tokio::spawn(Arc::clone(&queue).worker_loop());
        *queue.worker.lock().expect("queue worker lock poisoned") = Some(handle);
        queue
    }

    /// Submit a prepared task with its work closure.
    ///
    /// # Errors
    /// Rejects duplicates and submissions after shutdown.
    pub fn submit(&self, task: Task, work: WorkFn) -> Result<TaskId> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::QueueShutdown);
        }
        let id = task.id.clone();
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.records.contains_key(&id) {
                return Err(Error::Validation(format!("duplicate task id: {}", id)));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.records.insert(
                id.clone(),
                QueueRecord {
                    task,
                    work,
                    seq,
                    token: CancellationToken::new(),
                },
            );
        }
        debug!(task = %id, "task queued");
        self.worker_wake.notify_one();
        Ok(id)
    }

    /// Convenience: queue a work closure under a generated id.
    pub fn add_task(&self, work: WorkFn) -> Result<Task> {
        let task = Task::new(TaskId::new());
        let snapshot = task.clone();
        self.submit(task, work)?;
        Ok(snapshot)
    }

    /// Snapshot of a task's metadata and status.
    pub fn get_task(&self, id: &TaskId) -> Option<Task> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.records.get(id).map(|r| r.task.clone())
    }

    /// Cancel a task. Pending tasks are marked immediately; running tasks
    /// get their token cancelled and finish cooperatively. Returns false
    /// for unknown or already-terminal tasks.
    pub fn cancel_task(&self, id: &TaskId) -> bool {
        let cancelled = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let Some(record) = inner.records.get_mut(id) else {
                return false;
            };
            if record.task.is_terminal() {
                return false;
            }
            record.token.cancel();
            if record.task.status != TaskStatus::Running {
                record.task.cancel("cancelled by caller");
                true
            } else {
                false
            }
        };
        info!(task = %id, "queued task cancelled");
        if cancelled {
            self.done_wake.notify_waiters();
        }
        true
    }

    /// Suspend until the task reaches a terminal state or the timeout
    /// elapses.
    ///
    /// Returns the result value only on successful completion; `None` on
    /// timeout, failure, or cancellation, so callers can apply a fallback
    /// uniformly. An id the queue does not know yet keeps waiting rather
    /// than failing: scheduled runs are enqueued under `"{id}_run_{n}"`
    /// only when their timer fires, so waiters may arrive first.
    pub async fn wait_for_task(&self, id: &TaskId, timeout: Option<Duration>) -> Option<Value> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            // Register interest before checking state so a terminal
            // transition between the check and the await is not missed.
            let notified = self.done_wake.notified();
            if let Some(task) = self.get_task(id) {
                match task.status {
                    TaskStatus::Completed => return task.result,
                    status if status.is_terminal() => return None,
                    _ => {}
                }
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Counts of queued tasks by status.
    pub fn get_queue_stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut stats = QueueStats {
            total: inner.records.len(),
            ..Default::default()
        };
        for record in inner.records.values() {
            match record.task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed { .. } => stats.failed += 1,
                TaskStatus::Cancelled { .. } => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Stop the worker gracefully: no further admissions, running tasks
    /// finish and record their outcomes.
    pub async fn shutdown(&self) {
        info!("queue shutting down");
        self.shutdown_token.cancel();
        self.worker_wake.notify_one();
        let handle = self
            .worker
            .lock()
            .expect("queue worker lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn running_count(&self) -> usize {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .records
            .values()
            .filter(|r| r.task.status == TaskStatus::Running)
            .count()
    }

    /// Start as many pending tasks as the cap allows, highest priority
    /// first, insertion order on ties.
    fn admit(&self, done_tx: &mpsc::UnboundedSender<(TaskId, Result<Value>)>) {
        loop {
            if self.running_count() >= self.max_concurrency {
                return;
            }
            let next = {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                let best = inner
                    .records
                    .values()
                    .filter(|r| r.task.can_start() && !r.token.is_cancelled())
                    .map(|r| (r.task.priority, r.seq, r.task.id.clone()))
                    .min_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                let Some((_, _, id)) = best else {
                    return;
                };
                let record = inner
                    .records
                    .get_mut(&id)
                    .expect("candidate id must be present");
                record.task.start();
                (
                    id,
                    record.work.clone(),
                    record.task.timeout,
                    record.task.retry,
                    record.token.clone(),
                )
            };
            let (id, work, timeout, retry, token) = next;
            debug!(task = %id, "queued task started");
            let tx = done_tx.clone();
            tokio::spawn(async move {
                let outcome = drive_attempts(id.clone(), work, timeout, retry, token).await;
                let _ = tx.send((id, outcome));
            });
        }
    }

    fn finish(&self, id: &TaskId, outcome: Result<Value>) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let Some(record) = inner.records.get_mut(id) else {
                return;
            };
            match outcome {
                Ok(value) => {
                    record.task.complete(value);
                    info!(task = %id, "queued task completed");
                }
                Err(Error::Cancelled { reason, .. }) => {
                    record.task.cancel(&reason);
                    info!(task = %id, %reason, "queued task cancelled during execution");
                }
                Err(err) => {
                    let message = err.to_string();
                    record.task.fail(&message);
                    warn!(task = %id, error = %message, "queued task failed");
                }
            }
        }
        self.done_wake.notify_waiters();
    }

    async fn worker_loop(self: Arc<Self>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        loop {
            let shutting_down = self.shutdown_token.is_cancelled();
            if !shutting_down {
                self.admit(&done_tx);
            } else if self.running_count() == 0 {
                break;
            }

            tokio::select! {
                _ = self.shutdown_token.cancelled(), if !shutting_down => {}
                _ = self.worker_wake.notified(), if !shutting_down => {}
                maybe = done_rx.recv() => {
                    if let Some((id, outcome)) = maybe {
                        self.finish(&id, outcome);
                    }
                }
            }
        }
        debug!("queue worker stopped");
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("queue lock poisoned");
        f.debug_struct("TaskQueue")
            .field("max_concurrency", &self.max_concurrency)
            .field("tasks", &inner.records.len())
            .finish()
    }
}
