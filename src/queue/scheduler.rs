//! One-shot and periodic task scheduling on top of the queue.
//!
//! Each schedule gets its own timer task: when it fires, a fresh copy of
//! the base task is enqueued under `"{schedule_id}_run_{n}"` and the next
//! firing time is recomputed. Cancellation stops the timer and removes
//! the bookkeeping entry; periodic schedules also remove themselves once
//! `max_runs` is exhausted.

use crate::core::task::{Task, TaskId, WorkFn};
use crate::error::{Error, Result};
use crate::queue::queue::TaskQueue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// When and how often a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Fire once at the given time (immediately if already past).
    At(DateTime<Utc>),
    /// Fire repeatedly at the given interval.
    Every(Duration),
}

/// Bookkeeping snapshot of one schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Schedule identifier (the base task's id).
    pub id: String,
    /// The firing rule.
    pub schedule: Schedule,
    /// Upper bound on runs for periodic schedules.
    pub max_runs: Option<u32>,
    /// Runs enqueued so far.
    pub runs_completed: u32,
    /// When the schedule fires next; `None` once exhausted.
    pub next_run_at: Option<DateTime<Utc>>,
}

struct ScheduleEntry {
    snapshot: ScheduledTask,
    token: CancellationToken,
}

/// Enqueues tasks on a [`TaskQueue`] from timed schedules.
pub struct TaskScheduler {
    queue: Arc<TaskQueue>,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl TaskScheduler {
    /// Create a scheduler feeding the given queue.
    pub fn new(queue: Arc<TaskQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Register a schedule and start its timer.
    ///
    /// `base` supplies the id (which becomes the schedule id) and the
    /// metadata copied onto every run: priority, timeout, retry policy,
    /// description. `max_runs` bounds periodic schedules and is ignored
    /// for one-shots. Returns the schedule id.
    ///
    /// # Errors
    /// Rejects a schedule id that is already registered.
    pub fn schedule_task(
        self: &Arc<Self>,
        base: Task,
        schedule: Schedule,
        max_runs: Option<u32>,
        work: WorkFn,
    ) -> Result<String> {
        let id = base.id.to_string();
        let token = CancellationToken::new();
        {
            let mut entries = self.entries.lock().expect("scheduler lock poisoned");
            if entries.contains_key(&id) {
                return Err(Error::Validation(format!(
                    "schedule id already registered: {}",
                    id
                )));
            }
            let next_run_at = match schedule {
                Schedule::At(when) => Some(when),
                Schedule::Every(interval) => {
                    Some(Utc::now() + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero()))
                }
            };
            entries.insert(
                id.clone(),
                ScheduleEntry {
                    snapshot: ScheduledTask {
                        id: id.clone(),
                        schedule,
                        max_runs,
                        runs_completed: 0,
                        next_run_at,
                    },
                    token: token.clone(),
                },
            );
        }

        info!(schedule = %id, "schedule registered");
        tokio::spawn(Arc::clone(self).timer_loop(id.clone(), base, schedule, max_runs, work, token));
        Ok(id)
    }

    /// Cancel a schedule: stop its timer and drop the bookkeeping entry.
    /// Already-enqueued runs are unaffected. Returns false if unknown.
    pub fn cancel_scheduled_task(&self, id: &str) -> bool {
        let entry = {
            let mut entries = self.entries.lock().expect("scheduler lock poisoned");
            entries.remove(id)
        };
        match entry {
            Some(entry) => {
                entry.token.cancel();
                info!(schedule = %id, "schedule cancelled");
                true
            }
            None => false,
        }
    }

    /// Snapshot of a schedule's bookkeeping, if still registered.
    pub fn scheduled(&self, id: &str) -> Option<ScheduledTask> {
        let entries = self.entries.lock().expect("scheduler lock poisoned");
        entries.get(id).map(|e| e.snapshot.clone())
    }

    /// Ids of all live schedules.
    pub fn scheduled_ids(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("scheduler lock poisoned");
        entries.keys().cloned().collect()
    }

    async fn timer_loop(
        self: Arc<Self>,
        id: String,
        base: Task,
        schedule: Schedule,
        max_runs: Option<u32>,
        work: WorkFn,
        token: CancellationToken,
    ) {
        let mut runs = 0u32;
        loop {
            let wait = match schedule {
                Schedule::At(when) => (when - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                Schedule::Every(interval) => interval,
            };
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            runs += 1;
            let run_id = format!("{}_run_{}", id, runs);
            let mut run_task = base.clone();
            run_task.id = TaskId::from(run_id.as_str());
            run_task.created_at = Utc::now();
            debug!(schedule = %id, run = %run_id, "schedule fired");
            if self.queue.submit(run_task, work.clone()).is_err() {
                // Queue is gone; nothing left to schedule for
                break;
            }

            let exhausted = match schedule {
                Schedule::At(_) => true,
                Schedule::Every(_) => max_runs.is_some_and(|max| runs >= max),
            };
            {
                let mut entries = self.entries.lock().expect("scheduler lock poisoned");
                let Some(entry) = entries.get_mut(&id) else {
                    // Cancelled between firing and bookkeeping
                    return;
                };
                entry.snapshot.runs_completed = runs;
                entry.snapshot.next_run_at = if exhausted {
                    None
                } else if let Schedule::Every(interval) = schedule {
                    Some(Utc::now() + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero()))
                } else {
                    None
                };
            }
            if exhausted {
                break;
            }
        }

        let mut entries = self.entries.lock().expect("scheduler lock poisoned");
        entries.remove(&id);
        debug!(schedule = %id, total_runs = runs, "schedule finished");
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock().expect("scheduler lock poisoned");
        f.debug_struct("TaskScheduler")
            .field("schedules", &entries.len())
            .finish()
    }
}
