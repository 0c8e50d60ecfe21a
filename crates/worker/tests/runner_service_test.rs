use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crawlhub_core::models::TaskStatus;
use crawlhub_core::traits::Repositories;
use crawlhub_core::SchedulerError;
use crawlhub_infrastructure::{MemoryStore, SystemProcessBuilder};
use crawlhub_testing_utils::{MemoryLogSinkFactory, NodeBuilder, TaskBuilder, TestEnv};
use crawlhub_worker::{RunnerConfig, RunnerContext, RunnerService};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn service(max_runners: u32) -> (Arc<RunnerService>, Repositories, TempDir) {
    let repos = MemoryStore::new().repositories();
    let workspace = tempfile::tempdir().unwrap();
    let ctx = RunnerContext {
        node_key: "worker-1".to_string(),
        repos: repos.clone(),
        log_sinks: MemoryLogSinkFactory::new(),
        processes: Arc::new(SystemProcessBuilder::new()),
        config: RunnerConfig {
            workspace_root: workspace.path().to_path_buf(),
            health_check_interval: Duration::from_millis(50),
            cancel_poll_interval: Duration::from_millis(20),
            exit_watch_timeout: Duration::from_secs(2),
            keep_workspace: false,
            env: HashMap::new(),
        },
    };
    let service = Arc::new(RunnerService::new(ctx, max_runners, Duration::from_millis(50)));
    (service, repos, workspace)
}

async fn save_task(repos: &Repositories, cmd: &str) -> Uuid {
    let task = TaskBuilder::new().with_cmd(cmd).build();
    repos.tasks.save(&task).await.unwrap();
    task.id
}

async fn wait_status(repos: &Repositories, task_id: Uuid, status: TaskStatus) -> bool {
    TestEnv::wait_for(
        || {
            let repos = repos.clone();
            async move {
                repos.tasks.get_by_id(task_id).await.unwrap().map(|t| t.status) == Some(status)
            }
        },
        Duration::from_secs(5),
    )
    .await
}

#[tokio::test]
async fn test_concurrent_run_has_single_winner() {
    let (service, repos, _workspace) = service(8);
    let task_id = save_task(&repos, "sleep 1").await;

    let attempts: Vec<_> = (0..10)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.run(task_id).await })
        })
        .collect();

    let mut accepted = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(()) => accepted += 1,
            Err(SchedulerError::RunnerAlreadyExists { id }) => assert_eq!(id, task_id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(service.running_count().await, 1);

    service.cancel_all().await;
}

#[tokio::test]
async fn test_capacity_rejects_then_accepts() {
    let (service, repos, _workspace) = service(1);
    let first = save_task(&repos, "sleep 0.3").await;
    let second = save_task(&repos, "true").await;

    service.run(first).await.unwrap();
    assert!(matches!(
        service.run(second).await,
        Err(SchedulerError::NoAvailableRunners)
    ));
    assert_eq!(service.available_runners().await, 0);

    assert!(wait_status(&repos, first, TaskStatus::Finished).await);
    let freed = TestEnv::wait_for(
        || {
            let service = service.clone();
            async move { service.running_count().await == 0 }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(freed);

    service.run(second).await.unwrap();
    assert!(wait_status(&repos, second, TaskStatus::Finished).await);
}

#[tokio::test]
async fn test_report_available_runners() {
    let (service, repos, _workspace) = service(3);
    repos
        .nodes
        .save(&NodeBuilder::new("worker-1").with_capacity(3, 3).build())
        .await
        .unwrap();

    let task_id = save_task(&repos, "sleep 10").await;
    service.run(task_id).await.unwrap();
    assert_eq!(service.report_once().await.unwrap(), 2);
    let node = repos.nodes.get_by_key("worker-1").await.unwrap().unwrap();
    assert_eq!(node.available_runners, 2);

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(service.clone().report_handler_status(cancel.clone()));

    service.cancel(task_id).await.unwrap();
    assert!(wait_status(&repos, task_id, TaskStatus::Cancelled).await);

    let reported = TestEnv::wait_for(
        || {
            let repos = repos.clone();
            async move {
                repos
                    .nodes
                    .get_by_key("worker-1")
                    .await
                    .unwrap()
                    .map(|n| n.available_runners)
                    == Some(3)
            }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(reported);

    cancel.cancel();
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn test_cancel_unknown_runner() {
    let (service, _repos, _workspace) = service(1);
    let err = service.cancel(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::RunnerNotFound { .. }));
}

#[tokio::test]
async fn test_init_failure_marks_task_error() {
    let (service, repos, _workspace) = service(1);
    let task = TaskBuilder::new().with_spider(Uuid::new_v4()).build();
    repos.tasks.save(&task).await.unwrap();

    service.run(task.id).await.unwrap();
    assert!(wait_status(&repos, task.id, TaskStatus::Error).await);
}

#[tokio::test]
async fn test_cancelled_task_is_not_overwritten() {
    let (service, repos, _workspace) = service(1);
    let task = TaskBuilder::new().with_status(TaskStatus::Cancelled).build();
    repos.tasks.save(&task).await.unwrap();

    service.run(task.id).await.unwrap();
    let drained = TestEnv::wait_for(
        || {
            let service = service.clone();
            async move { service.running_count().await == 0 }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(drained);

    let stored = repos.tasks.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
}
