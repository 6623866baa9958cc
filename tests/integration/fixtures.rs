//! Test fixtures for integration tests.
//!
//! Provides work-closure helpers that record execution order and
//! in-flight concurrency, so scenarios can assert on scheduling behavior
//! rather than on results alone.

use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskmill::{work_fn, Error, TaskId, WorkFn};

/// Shared log of execution order, pushed by [`logged_work`] closures.
pub type ExecutionLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> ExecutionLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn log_entries(log: &ExecutionLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Work that records its name in the log, optionally holding its slot.
pub fn logged_work(log: ExecutionLog, name: &str, hold: Duration) -> WorkFn {
    let name = name.to_string();
    work_fn(move || {
        let log = Arc::clone(&log);
        let name = name.clone();
        async move {
            log.lock().unwrap().push(name.clone());
            if !hold.is_zero() {
                tokio::time::sleep(hold).await;
            }
            Ok(Value::String(name))
        }
    })
}

/// Work that always fails with an execution error.
pub fn failing_work(name: &str) -> WorkFn {
    let name = name.to_string();
    work_fn(move || {
        let name = name.clone();
        async move {
            Err(Error::Execution {
                task_id: TaskId::from(name.as_str()),
                message: format!("{} blew up", name),
            })
        }
    })
}

/// Tracks the peak number of closures running at once.
pub struct ConcurrencyProbe {
    current: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self {
            current: Arc::new(AtomicU32::new(0)),
            peak: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Work that holds a slot for `hold` while counted by the probe.
    pub fn work(&self, hold: Duration) -> WorkFn {
        let current = Arc::clone(&self.current);
        let peak = Arc::clone(&self.peak);
        work_fn(move || {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    }
}
