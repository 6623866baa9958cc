//! Pool-bounded admission under contention.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use taskmill::{
    work_fn, ParallelTaskExecutor, ResourcePool, ResourceRequirement, ResourceType, Task, TaskId,
};

use crate::fixtures::ConcurrencyProbe;

#[tokio::test]
async fn contended_resource_serializes_despite_free_slots() {
    let exec = ParallelTaskExecutor::new(4);
    let probe = ConcurrencyProbe::new();

    for name in ["t1", "t2", "t3"] {
        exec.add_task(
            Task::new(name).with_resource(ResourceRequirement::new(ResourceType::Database, 0.6)),
            probe.work(Duration::from_millis(20)),
        )
        .unwrap();
    }

    let results = exec.execute_all().await.unwrap();
    assert_eq!(results.len(), 3);
    // 0.6 each against a 1.0 pool: never two at once
    assert_eq!(probe.peak(), 1);
}

#[tokio::test]
async fn disjoint_resources_run_in_parallel() {
    let exec = ParallelTaskExecutor::new(4);
    let probe = ConcurrencyProbe::new();

    exec.add_task(
        Task::new("cpu").with_resource(ResourceRequirement::new(ResourceType::Cpu, 0.9)),
        probe.work(Duration::from_millis(30)),
    )
    .unwrap();
    exec.add_task(
        Task::new("net").with_resource(ResourceRequirement::new(ResourceType::Network, 0.9)),
        probe.work(Duration::from_millis(30)),
    )
    .unwrap();

    exec.execute_all().await.unwrap();
    assert_eq!(probe.peak(), 2);
}

#[tokio::test]
async fn pool_is_fully_released_after_batch() {
    let exec = ParallelTaskExecutor::new(2);
    for name in ["a", "b"] {
        exec.add_task(
            Task::new(name)
                .with_resource(ResourceRequirement::new(ResourceType::Cpu, 0.5))
                .with_resource(ResourceRequirement::new(ResourceType::Memory, 0.3)),
            work_fn(|| async { Ok(Value::Null) }),
        )
        .unwrap();
    }

    exec.execute_all().await.unwrap();

    let available = exec.pool().available();
    for resource in ResourceType::ALL {
        assert!(
            (available[&resource] - 1.0).abs() < 1e-9,
            "{} not fully released",
            resource
        );
    }
}

#[tokio::test]
async fn failed_task_releases_its_resources() {
    let exec = ParallelTaskExecutor::new(2);
    exec.add_task(
        Task::new("bad").with_resource(ResourceRequirement::new(ResourceType::Gpu, 0.8)),
        crate::fixtures::failing_work("bad"),
    )
    .unwrap();

    let _ = exec.execute_all().await;
    assert!(exec.pool().allocation(&TaskId::from("bad")).is_empty());
    assert!((exec.pool().available()[&ResourceType::Gpu] - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn shared_pool_spans_executors() {
    let pool = Arc::new(ResourcePool::with_capacities(HashMap::from([(
        ResourceType::Api,
        0.5,
    )])));
    let probe = ConcurrencyProbe::new();

    let exec1 = ParallelTaskExecutor::new(2).with_pool(Arc::clone(&pool));
    let exec2 = ParallelTaskExecutor::new(2).with_pool(Arc::clone(&pool));
    exec1
        .add_task(
            Task::new("one").with_resource(ResourceRequirement::new(ResourceType::Api, 0.4)),
            probe.work(Duration::from_millis(30)),
        )
        .unwrap();
    exec2
        .add_task(
            Task::new("two").with_resource(ResourceRequirement::new(ResourceType::Api, 0.4)),
            probe.work(Duration::from_millis(30)),
        )
        .unwrap();

    let (r1, r2) = tokio::join!(exec1.execute_all(), exec2.execute_all());
    // Whichever executor loses the race waits out the other's hold
    // instead of giving up, so both runs finish their task.
    assert_eq!(r1.unwrap().len(), 1);
    assert_eq!(r2.unwrap().len(), 1);
    assert_eq!(
        exec1.get_task(&TaskId::from("one")).unwrap().status,
        taskmill::TaskStatus::Completed
    );
    assert_eq!(
        exec2.get_task(&TaskId::from("two")).unwrap().status,
        taskmill::TaskStatus::Completed
    );
    // The 0.5-capacity pool admits only one 0.4 claim at a time
    assert_eq!(probe.peak(), 1);
}

#[tokio::test]
async fn exclusive_claim_blocks_fractional_sharers() {
    let exec = ParallelTaskExecutor::new(4);
    let probe = ConcurrencyProbe::new();

    exec.add_task(
        Task::new("exclusive").with_resource(ResourceRequirement::exclusive(ResourceType::Model)),
        probe.work(Duration::from_millis(20)),
    )
    .unwrap();
    exec.add_task(
        Task::new("sharer").with_resource(ResourceRequirement::new(ResourceType::Model, 0.1)),
        probe.work(Duration::from_millis(20)),
    )
    .unwrap();

    exec.execute_all().await.unwrap();
    assert_eq!(probe.peak(), 1);
}
