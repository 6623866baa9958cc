//! End-to-end batch runs over dependency graphs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_test::{assert_err, assert_ok};
use taskmill::{work_fn, ParallelTaskExecutor, Task, TaskId, TaskStatus};

use crate::fixtures::{log_entries, logged_work, new_log};

#[tokio::test]
async fn diamond_pipeline_runs_in_dependency_order() {
    // fetch -> (parse, validate) -> report
    let exec = ParallelTaskExecutor::new(4);
    let log = new_log();
    exec.add_task(
        Task::new("fetch"),
        logged_work(Arc::clone(&log), "fetch", Duration::ZERO),
    )
    .unwrap();
    exec.add_task(
        Task::new("parse").with_dependency("fetch"),
        logged_work(Arc::clone(&log), "parse", Duration::ZERO),
    )
    .unwrap();
    exec.add_task(
        Task::new("validate").with_dependency("fetch"),
        logged_work(Arc::clone(&log), "validate", Duration::ZERO),
    )
    .unwrap();
    exec.add_task(
        Task::new("report")
            .with_dependency("parse")
            .with_dependency("validate"),
        logged_work(Arc::clone(&log), "report", Duration::ZERO),
    )
    .unwrap();

    let results = tokio_test::assert_ok!(exec.execute_all().await);
    assert_eq!(results.len(), 4);

    let order = log_entries(&log);
    assert_eq!(order[0], "fetch");
    assert_eq!(order[3], "report");

    // Started-at/completed-at pairs confirm the ordering was observable
    let fetch = exec.get_task(&TaskId::from("fetch")).unwrap();
    let report = exec.get_task(&TaskId::from("report")).unwrap();
    assert!(report.started_at.unwrap() >= fetch.completed_at.unwrap());
}

#[tokio::test]
async fn single_slot_fan_out_starts_with_root() {
    let exec = ParallelTaskExecutor::new(1);
    let log = new_log();
    exec.add_task(
        Task::new("a"),
        logged_work(Arc::clone(&log), "a", Duration::ZERO),
    )
    .unwrap();
    exec.add_task(
        Task::new("b").with_dependency("a"),
        logged_work(Arc::clone(&log), "b", Duration::ZERO),
    )
    .unwrap();
    exec.add_task(
        Task::new("c").with_dependency("a"),
        logged_work(Arc::clone(&log), "c", Duration::ZERO),
    )
    .unwrap();

    exec.execute_all().await.unwrap();

    let order = log_entries(&log);
    assert_eq!(order[0], "a");
    assert_eq!(order.len(), 3);
    assert!(order[1..].contains(&"b".to_string()));
    assert!(order[1..].contains(&"c".to_string()));
}

#[tokio::test]
async fn priorities_drive_admission_order() {
    let exec = ParallelTaskExecutor::new(1);
    let log = new_log();
    for (name, priority) in [("background", -1), ("urgent", 10), ("normal", 0)] {
        exec.add_task(
            Task::new(name).with_priority(priority),
            logged_work(Arc::clone(&log), name, Duration::ZERO),
        )
        .unwrap();
    }

    exec.execute_all().await.unwrap();
    assert_eq!(log_entries(&log), vec!["urgent", "normal", "background"]);
}

#[tokio::test]
async fn results_flow_between_stages_via_caller_state() {
    // Stages communicate through caller-owned shared state; the executor
    // only carries opaque result values.
    let exec = ParallelTaskExecutor::new(2);
    let upstream = Arc::new(std::sync::Mutex::new(None::<i64>));

    let producer_state = Arc::clone(&upstream);
    exec.add_task(
        Task::new("produce"),
        work_fn(move || {
            let state = Arc::clone(&producer_state);
            async move {
                *state.lock().unwrap() = Some(21);
                Ok(serde_json::json!(21))
            }
        }),
    )
    .unwrap();

    let consumer_state = Arc::clone(&upstream);
    exec.add_task(
        Task::new("consume").with_dependency("produce"),
        work_fn(move || {
            let state = Arc::clone(&consumer_state);
            async move {
                let input = state.lock().unwrap().expect("producer ran first");
                Ok(serde_json::json!(input * 2))
            }
        }),
    )
    .unwrap();

    let results = tokio_test::assert_ok!(exec.execute_all().await);
    assert_eq!(results.get(&TaskId::from("consume")), Some(&serde_json::json!(42)));
}

#[tokio::test]
async fn failed_stage_blocks_downstream_and_fails_batch() {
    let exec = ParallelTaskExecutor::new(4);
    let log = new_log();
    exec.add_task(Task::new("bad"), crate::fixtures::failing_work("bad"))
        .unwrap();
    exec.add_task(
        Task::new("downstream").with_dependency("bad"),
        logged_work(Arc::clone(&log), "downstream", Duration::ZERO),
    )
    .unwrap();
    exec.add_task(
        Task::new("independent"),
        logged_work(Arc::clone(&log), "independent", Duration::ZERO),
    )
    .unwrap();

    let err = tokio_test::assert_err!(exec.execute_all().await);
    assert!(err.to_string().contains("blew up"));

    // The unrelated sibling still ran; the dependent never did
    let order = log_entries(&log);
    assert!(order.contains(&"independent".to_string()));
    assert!(!order.contains(&"downstream".to_string()));
    assert_eq!(
        exec.get_task(&TaskId::from("downstream")).unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn batch_metrics_reflect_final_states() {
    let exec = ParallelTaskExecutor::new(4);
    exec.add_task(Task::new("ok1"), work_fn(|| async { Ok(Value::Null) }))
        .unwrap();
    exec.add_task(Task::new("ok2"), work_fn(|| async { Ok(Value::Null) }))
        .unwrap();
    exec.add_task(Task::new("bad"), crate::fixtures::failing_work("bad"))
        .unwrap();
    exec.add_task(
        Task::new("blocked").with_dependency("bad"),
        work_fn(|| async { Ok(Value::Null) }),
    )
    .unwrap();

    let _ = exec.execute_all().await;

    let metrics = exec.get_task_metrics();
    assert_eq!(metrics.total, 4);
    assert_eq!(metrics.completed, 2);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.pending, 1);
    assert_eq!(metrics.running, 0);
    assert_eq!(metrics.cancelled, 0);
}
