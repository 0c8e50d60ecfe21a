use std::sync::Arc;
use std::time::Duration;

use crawlhub_core::models::{RunMode, StreamMessage, StreamMessageCode, TaskStatus};
use crawlhub_core::traits::Repositories;
use crawlhub_core::SchedulerError;
use crawlhub_dispatcher::{NodeService, Subscription, TaskScheduler};
use crawlhub_infrastructure::queue::{node_queue_key, PUBLIC_QUEUE};
use crawlhub_infrastructure::{InMemoryTaskQueue, MemoryStore, TaskQueue};
use crawlhub_testing_utils::{NodeBuilder, TaskBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    repos: Repositories,
    queue: Arc<InMemoryTaskQueue>,
    node_service: Arc<NodeService>,
    scheduler: Arc<TaskScheduler>,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let queue = Arc::new(InMemoryTaskQueue::new());
        let node_service = Arc::new(NodeService::new(repos.nodes.clone(), Vec::new()));
        let scheduler = Arc::new(TaskScheduler::new(
            repos.clone(),
            queue.clone(),
            node_service.clone(),
            Duration::from_millis(20),
        ));
        Self {
            repos,
            queue,
            node_service,
            scheduler,
        }
    }

    /// 添加在线节点并订阅其消息流
    async fn online_node(&self, key: &str) -> mpsc::Receiver<StreamMessage> {
        self.repos.nodes.save(&NodeBuilder::new(key).build()).await.unwrap();
        let (subscription, rx) = Subscription::new(16);
        self.node_service.set_subscribe(key, subscription).await;
        rx
    }
}

fn drain(rx: &mut mpsc::Receiver<StreamMessage>) -> Vec<StreamMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}

#[tokio::test]
async fn test_enqueue_routes_pinned_tasks_to_node_queue() {
    let harness = Harness::new();

    let pinned = TaskBuilder::new().pinned_to("worker-1").build();
    let public = TaskBuilder::new().build();
    harness.scheduler.enqueue(pinned).await.unwrap();
    harness.scheduler.enqueue(public).await.unwrap();

    assert_eq!(harness.queue.count(&node_queue_key("worker-1")).await.unwrap(), 1);
    assert_eq!(harness.queue.count(PUBLIC_QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_higher_priority_is_assigned_first() {
    let harness = Harness::new();
    let mut rx = harness.online_node("worker-1").await;

    let low = TaskBuilder::new().with_priority(5).build();
    let high = TaskBuilder::new().with_priority(10).build();
    let low_id = harness.scheduler.enqueue(low).await.unwrap();
    let high_id = harness.scheduler.enqueue(high).await.unwrap();

    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 1);
    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 1);

    let order: Vec<_> = drain(&mut rx)
        .iter()
        .map(|msg| msg.task_id().unwrap())
        .collect();
    assert_eq!(order, vec![high_id, low_id]);
}

#[tokio::test]
async fn test_random_node_assignment_sets_node_and_sends_run() {
    let harness = Harness::new();
    let mut rx = harness.online_node("worker-1").await;

    let task = TaskBuilder::new().with_mode(RunMode::RandomNode).build();
    let task_id = harness.scheduler.enqueue(task).await.unwrap();
    harness.scheduler.fetch_once().await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].code, StreamMessageCode::Run);
    assert_eq!(messages[0].task_id().unwrap(), task_id);

    let stored = harness.repos.tasks.get_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(stored.node_id.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn test_all_nodes_sends_one_run_per_node() {
    let harness = Harness::new();
    let mut receivers = Vec::new();
    for key in ["worker-1", "worker-2", "worker-3"] {
        receivers.push(harness.online_node(key).await);
    }

    let task = TaskBuilder::new().with_mode(RunMode::AllNodes).build();
    let parent_id = harness.scheduler.enqueue(task).await.unwrap();
    harness.scheduler.fetch_once().await.unwrap();

    let mut run_ids = Vec::new();
    for rx in receivers.iter_mut() {
        let messages = drain(rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].code, StreamMessageCode::Run);
        run_ids.push(messages[0].task_id().unwrap());
    }
    run_ids.sort();
    run_ids.dedup();
    assert_eq!(run_ids.len(), 3);

    let parent = harness.repos.tasks.get_by_id(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.status, TaskStatus::Running);
    let children = harness.repos.tasks.list_children(parent_id).await.unwrap();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|child| run_ids.contains(&child.id)));
}

#[tokio::test]
async fn test_no_eligible_node_requeues_task() {
    let harness = Harness::new();

    let task_id = harness
        .scheduler
        .enqueue(TaskBuilder::new().build())
        .await
        .unwrap();
    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 0);

    assert_eq!(harness.queue.count(PUBLIC_QUEUE).await.unwrap(), 1);
    let stored = harness.repos.tasks.get_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);

    // 节点上线后任务被分配
    let mut rx = harness.online_node("worker-1").await;
    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 1);
    assert_eq!(drain(&mut rx).len(), 1);
    assert_eq!(harness.queue.count(PUBLIC_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_subscription_requeues_and_clears_node() {
    let harness = Harness::new();
    harness
        .repos
        .nodes
        .save(&NodeBuilder::new("worker-1").build())
        .await
        .unwrap();

    let task_id = harness
        .scheduler
        .enqueue(TaskBuilder::new().build())
        .await
        .unwrap();
    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 0);

    assert_eq!(harness.queue.count(PUBLIC_QUEUE).await.unwrap(), 1);
    let stored = harness.repos.tasks.get_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(stored.node_id, None);
}

#[tokio::test]
async fn test_cancel_pending_task_drops_queue_entry() {
    let harness = Harness::new();
    let mut rx = harness.online_node("worker-1").await;

    let task_id = harness
        .scheduler
        .enqueue(TaskBuilder::new().build())
        .await
        .unwrap();
    harness.scheduler.cancel(task_id).await.unwrap();

    let stored = harness.repos.tasks.get_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert!(stored.finished_at.is_some());

    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 0);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(harness.queue.count(PUBLIC_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_running_task_sends_cancel_to_owner() {
    let harness = Harness::new();
    let mut rx = harness.online_node("worker-1").await;

    let task = TaskBuilder::new()
        .pinned_to("worker-1")
        .with_status(TaskStatus::Running)
        .build();
    harness.repos.tasks.save(&task).await.unwrap();

    harness.scheduler.cancel(task.id).await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].code, StreamMessageCode::Cancel);
    assert_eq!(messages[0].task_id().unwrap(), task.id);

    // 状态由节点写回，master不直接修改
    let stored = harness.repos.tasks.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_cancel_terminal_task_is_rejected() {
    let harness = Harness::new();
    let task = TaskBuilder::new().with_status(TaskStatus::Finished).build();
    harness.repos.tasks.save(&task).await.unwrap();

    let err = harness.scheduler.cancel(task.id).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::InvalidTaskState {
            status: TaskStatus::Finished,
            ..
        }
    ));
}

#[tokio::test]
async fn test_cancel_parent_cancels_children() {
    let harness = Harness::new();
    let mut rx1 = harness.online_node("worker-1").await;
    let mut rx2 = harness.online_node("worker-2").await;

    let task = TaskBuilder::new()
        .with_node_ids(&["worker-1", "worker-2"])
        .build();
    let parent_id = harness.scheduler.enqueue(task).await.unwrap();
    harness.scheduler.fetch_once().await.unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    let children = harness.repos.tasks.list_children(parent_id).await.unwrap();
    let running = &children[0];
    harness
        .repos
        .tasks
        .update_status(running.id, TaskStatus::Running, None)
        .await
        .unwrap();

    harness.scheduler.cancel(parent_id).await.unwrap();

    // 运行中的子任务由节点终止，已下发但未启动的子任务也通知节点丢弃
    let mut cancelled_ids: Vec<_> = drain(&mut rx1)
        .into_iter()
        .chain(drain(&mut rx2))
        .filter(|msg| msg.code == StreamMessageCode::Cancel)
        .map(|msg| msg.task_id().unwrap())
        .collect();
    cancelled_ids.sort();
    let mut expected = vec![running.id, children[1].id];
    expected.sort();
    assert_eq!(cancelled_ids, expected);

    let pending_child = harness.repos.tasks.get_by_id(children[1].id).await.unwrap().unwrap();
    assert_eq!(pending_child.status, TaskStatus::Cancelled);
    let parent = harness.repos.tasks.get_by_id(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_assignment_reserves_node_capacity() {
    let harness = Harness::new();
    harness
        .repos
        .nodes
        .save(&NodeBuilder::new("worker-1").with_capacity(1, 1).build())
        .await
        .unwrap();
    let (subscription, mut rx) = Subscription::new(16);
    harness.node_service.set_subscribe("worker-1", subscription).await;

    for _ in 0..3 {
        harness
            .scheduler
            .enqueue(TaskBuilder::new().with_mode(RunMode::RandomNode).build())
            .await
            .unwrap();
    }
    for _ in 0..3 {
        harness.scheduler.fetch_once().await.unwrap();
    }

    let runs = drain(&mut rx)
        .into_iter()
        .filter(|msg| msg.code == StreamMessageCode::Run)
        .count();
    assert_eq!(runs, 1);
    assert_eq!(harness.queue.count(PUBLIC_QUEUE).await.unwrap(), 2);
    let node = harness.repos.nodes.get_by_key("worker-1").await.unwrap().unwrap();
    assert_eq!(node.available_runners, 0);
}

#[tokio::test]
async fn test_released_task_is_requeued() {
    let harness = Harness::new();
    let mut rx = harness.online_node("worker-1").await;

    let task_id = harness
        .scheduler
        .enqueue(TaskBuilder::new().with_mode(RunMode::RandomNode).build())
        .await
        .unwrap();
    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 1);
    assert_eq!(drain(&mut rx).len(), 1);

    // 节点未接手前不会重复入队
    assert_eq!(harness.scheduler.requeue_released().await.unwrap(), 0);

    // 节点名额已满，退回任务
    assert!(harness.repos.tasks.release(task_id).await.unwrap());
    assert_eq!(harness.scheduler.requeue_released().await.unwrap(), 1);
    assert_eq!(harness.queue.count(PUBLIC_QUEUE).await.unwrap(), 1);

    let stored = harness.repos.tasks.get_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.node_id, None);

    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 1);
    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].task_id().unwrap(), task_id);
}

#[tokio::test]
async fn test_released_pinned_task_returns_to_node_queue() {
    let harness = Harness::new();
    let mut rx = harness.online_node("worker-1").await;

    let task_id = harness
        .scheduler
        .enqueue(TaskBuilder::new().pinned_to("worker-1").build())
        .await
        .unwrap();
    assert_eq!(harness.scheduler.fetch_once().await.unwrap(), 1);
    drain(&mut rx);

    harness.repos.tasks.release(task_id).await.unwrap();
    assert_eq!(harness.scheduler.requeue_released().await.unwrap(), 1);

    assert_eq!(harness.queue.count(&node_queue_key("worker-1")).await.unwrap(), 1);
    let stored = harness.repos.tasks.get_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(stored.node_id.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn test_cancel_dispatched_pending_task_notifies_node() {
    let harness = Harness::new();
    let mut rx = harness.online_node("worker-1").await;

    let task_id = harness
        .scheduler
        .enqueue(TaskBuilder::new().with_mode(RunMode::RandomNode).build())
        .await
        .unwrap();
    harness.scheduler.fetch_once().await.unwrap();
    drain(&mut rx);

    harness.scheduler.cancel(task_id).await.unwrap();

    let stored = harness.repos.tasks.get_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].code, StreamMessageCode::Cancel);
    assert_eq!(messages[0].task_id().unwrap(), task_id);

    // 已取消的任务不会被重新入队
    assert_eq!(harness.scheduler.requeue_released().await.unwrap(), 0);
}

#[tokio::test]
async fn test_fetch_loop_stops_on_cancel() {
    let harness = Harness::new();
    let mut rx = harness.online_node("worker-1").await;
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(harness.scheduler.clone().fetch(cancel.clone()));
    let task_id = harness
        .scheduler
        .enqueue(TaskBuilder::new().build())
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.task_id().unwrap(), task_id);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
