//! A client and a task manager sharing one queue and storage

mod common;

use anyhow::{bail, Result};
use foreman_config::{ManagerConfig, PoolConfig};
use foreman_execution::{
    Client, InMemoryTaskQueue, InMemoryTaskStorage, ReporterSnapshot, TaskId, TaskManager,
    TaskStatus, TaskStorage, WorkerPool,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_terminal(client: &Client, task_id: &TaskId) -> Result<ReporterSnapshot> {
    for _ in 0..100 {
        if let Some(snapshot) = client.check_task_status(task_id).await? {
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("task {} did not finish", task_id)
}

#[tokio::test]
async fn test_client_tasks_run_through_shared_queue() -> Result<()> {
    common::init_tracing();
    let storage = Arc::new(InMemoryTaskStorage::new());
    let queue = Arc::new(InMemoryTaskQueue::with_storage(storage.clone()));
    let client = Client::new(queue.clone(), Some(storage.clone()));

    // Queued before any manager serves the queue
    client.submit_task(common::return_after("kept", 0.1, json!(7))).await?;
    client.submit_task(common::return_after("dropped", 0.1, json!(8))).await?;
    client.cancel_task(&TaskId::new("dropped")).await?;

    let cancelled = client.check_task_status(&TaskId::new("dropped")).await?;
    assert_eq!(cancelled.map(|snapshot| snapshot.status), Some(TaskStatus::Cancelled));

    let config = ManagerConfig {
        idle_poll_interval: Duration::from_millis(100),
        busy_poll_interval: Duration::from_millis(20),
    };
    let pool = WorkerPool::new(&PoolConfig::default(), common::processes());
    let manager = TaskManager::new(queue, pool, Some(storage.clone()), &config);

    let kept = wait_for_terminal(&client, &TaskId::new("kept")).await?;
    assert_eq!(kept.status, TaskStatus::Completed);
    assert_eq!(kept.result, Some(json!(7)));

    client.submit_task(common::throw("thrown", "bad input")).await?;
    let thrown = wait_for_terminal(&client, &TaskId::new("thrown")).await?;
    assert_eq!(thrown.status, TaskStatus::Failed);
    assert!(thrown.error.unwrap_or_default().contains("bad input"));

    let finished = storage.find_by_status(true, 0, 10).await?;
    let ids: Vec<&str> = finished.iter().map(|snapshot| snapshot.task.id.as_str()).collect();
    assert_eq!(ids, vec!["kept", "dropped", "thrown"]);
    assert!(storage.find_by_status(false, 0, 10).await?.is_empty());
    assert_eq!(client.check_all_tasks_status().await?.len(), 3);

    // The dropped task never reached the pool
    assert_eq!(manager.stats().await?.pool.total_tasks, 2);

    manager.terminate_with_timeout(Duration::ZERO).await;
    Ok(())
}
