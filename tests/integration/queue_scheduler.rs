//! Continuous intake through the queue and timed schedules.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use taskmill::{work_fn, Schedule, Task, TaskId, TaskQueue, TaskScheduler, TaskStatus};

use crate::fixtures::{log_entries, logged_work, new_log};

#[tokio::test]
async fn queue_drains_by_priority_with_fallback_on_timeout() {
    let queue = TaskQueue::new(1);
    let log = new_log();

    // Hold the single slot so submissions pile up behind it
    let blocker = queue
        .submit(
            Task::new("blocker"),
            logged_work(Arc::clone(&log), "blocker", Duration::from_millis(60)),
        )
        .unwrap();

    // A caller that cannot wait applies its fallback on None
    let early = queue
        .wait_for_task(&blocker, Some(Duration::from_millis(10)))
        .await;
    assert!(early.is_none());

    for (name, priority) in [("cleanup", 0), ("ingest", 5)] {
        queue
            .submit(
                Task::new(name).with_priority(priority),
                logged_work(Arc::clone(&log), name, Duration::ZERO),
            )
            .unwrap();
    }

    queue
        .wait_for_task(&TaskId::from("cleanup"), Some(Duration::from_secs(2)))
        .await;
    assert_eq!(log_entries(&log), vec!["blocker", "ingest", "cleanup"]);

    let stats = queue.get_queue_stats();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 0);
    queue.shutdown().await;
}

#[tokio::test]
async fn scheduler_feeds_queue_with_periodic_runs() {
    let queue = TaskQueue::new(2);
    let scheduler = TaskScheduler::new(Arc::clone(&queue));
    let runs = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&runs);
    scheduler
        .schedule_task(
            Task::new("sync").with_priority(3),
            Schedule::Every(Duration::from_millis(25)),
            Some(3),
            work_fn(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();

    for n in 1..=3 {
        let id = TaskId::from(format!("sync_run_{}", n));
        assert!(
            queue
                .wait_for_task(&id, Some(Duration::from_secs(2)))
                .await
                .is_some(),
            "run {} missing",
            n
        );
        // Each run is an ordinary queued task carrying the base metadata
        assert_eq!(queue.get_task(&id).unwrap().priority, 3);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(scheduler.scheduled("sync").is_none());
    queue.shutdown().await;
}

#[tokio::test]
async fn one_shot_and_periodic_coexist() {
    let queue = TaskQueue::new(4);
    let scheduler = TaskScheduler::new(Arc::clone(&queue));
    let log = new_log();

    scheduler
        .schedule_task(
            Task::new("once"),
            Schedule::At(Utc::now() + chrono::Duration::milliseconds(20)),
            None,
            logged_work(Arc::clone(&log), "once", Duration::ZERO),
        )
        .unwrap();
    scheduler
        .schedule_task(
            Task::new("beat"),
            Schedule::Every(Duration::from_millis(20)),
            Some(2),
            logged_work(Arc::clone(&log), "beat", Duration::ZERO),
        )
        .unwrap();

    queue
        .wait_for_task(&TaskId::from("once_run_1"), Some(Duration::from_secs(2)))
        .await;
    queue
        .wait_for_task(&TaskId::from("beat_run_2"), Some(Duration::from_secs(2)))
        .await;

    let entries = log_entries(&log);
    assert_eq!(entries.iter().filter(|e| *e == "once").count(), 1);
    assert_eq!(entries.iter().filter(|e| *e == "beat").count(), 2);
    queue.shutdown().await;
}

#[tokio::test]
async fn cancelled_schedule_leaves_completed_runs_intact() {
    let queue = TaskQueue::new(2);
    let scheduler = TaskScheduler::new(Arc::clone(&queue));

    scheduler
        .schedule_task(
            Task::new("poll"),
            Schedule::Every(Duration::from_millis(20)),
            None,
            work_fn(|| async { Ok(serde_json::json!("polled")) }),
        )
        .unwrap();

    let first = TaskId::from("poll_run_1");
    assert!(queue
        .wait_for_task(&first, Some(Duration::from_secs(2)))
        .await
        .is_some());
    assert!(scheduler.cancel_scheduled_task("poll"));

    // The completed run survives; the schedule itself is gone
    assert_eq!(queue.get_task(&first).unwrap().status, TaskStatus::Completed);
    assert!(scheduler.scheduled("poll").is_none());
    assert!(scheduler.scheduled_ids().is_empty());
    queue.shutdown().await;
}

#[tokio::test]
async fn shutdown_mid_schedule_stops_cleanly() {
    let queue = TaskQueue::new(1);
    let scheduler = TaskScheduler::new(Arc::clone(&queue));

    scheduler
        .schedule_task(
            Task::new("tick"),
            Schedule::Every(Duration::from_millis(15)),
            None,
            work_fn(|| async { Ok(Value::Null) }),
        )
        .unwrap();
    queue
        .wait_for_task(&TaskId::from("tick_run_1"), Some(Duration::from_secs(2)))
        .await;

    queue.shutdown().await;
    // The timer notices the dead queue on its next submit and unregisters
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scheduler.scheduled("tick").is_none());
}
