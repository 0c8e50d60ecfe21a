use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crawlhub_core::{
    models::{aggregate_children_status, RunMode, StreamMessage, Task, TaskMessage, TaskStatus},
    traits::Repositories,
    SchedulerError, SchedulerResult,
};
use crawlhub_infrastructure::observability::metric_names;
use crawlhub_infrastructure::queue::{node_queue_key, PUBLIC_QUEUE};
use crawlhub_infrastructure::TaskQueue;

use crate::node_service::NodeService;
use crate::strategies::NodeSelector;

/// 已下发RUN、尚未被节点接手的任务
#[derive(Debug, Clone)]
struct Dispatched {
    queue_key: String,
    /// 分配前的 `node_id`，重新入队时恢复
    node_id: Option<String>,
}

/// master侧任务调度器
///
/// 负责入队、从队列取出任务并按运行模式分配到节点，以及取消任务。
/// 节点上的执行结果由worker直接写回任务记录。
///
/// 节点因名额已满拒绝任务时会清空任务的 `node_id`，
/// 调度器在下一轮取任务前把这些任务放回原队列。
pub struct TaskScheduler {
    repos: Repositories,
    queue: Arc<dyn TaskQueue>,
    node_service: Arc<NodeService>,
    selector: NodeSelector,
    fetch_interval: Duration,
    dispatched: Mutex<HashMap<Uuid, Dispatched>>,
}

impl TaskScheduler {
    pub fn new(
        repos: Repositories,
        queue: Arc<dyn TaskQueue>,
        node_service: Arc<NodeService>,
        fetch_interval: Duration,
    ) -> Self {
        Self {
            repos,
            queue,
            node_service,
            selector: NodeSelector::new(),
            fetch_interval,
            dispatched: Mutex::new(HashMap::new()),
        }
    }

    /// 任务入队
    ///
    /// 指定节点的单节点任务进入该节点的队列，其余进入公共队列。
    pub async fn enqueue(&self, mut task: Task) -> SchedulerResult<Uuid> {
        task.status = TaskStatus::Pending;
        self.repos.tasks.save(&task).await?;

        let queue_key = Self::queue_key_for(&task);
        self.queue
            .push(&queue_key, TaskMessage::from(&task), task.priority)
            .await?;
        metrics::counter!(metric_names::TASKS_ENQUEUED).increment(1);

        info!(
            "任务 {} 已入队 {} (优先级: {}, 模式: {:?})",
            task.id, queue_key, task.priority, task.mode
        );
        Ok(task.id)
    }

    fn queue_key_for(task: &Task) -> String {
        Self::queue_key_for_node(task, task.node_id.as_deref())
    }

    fn queue_key_for_node(task: &Task, node_id: Option<&str>) -> String {
        match (&task.mode, node_id) {
            (RunMode::SingleNode, Some(node_key)) => node_queue_key(node_key),
            _ => PUBLIC_QUEUE.to_string(),
        }
    }

    /// 调度循环，直到取消
    pub async fn fetch(self: Arc<Self>, cancel: CancellationToken) {
        info!("启动任务调度循环，空闲间隔 {:?}", self.fetch_interval);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let assigned = match self.fetch_once().await {
                Ok(assigned) => assigned,
                Err(e) => {
                    error!("调度任务时出错: {}", e);
                    0
                }
            };

            if assigned == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.fetch_interval) => {}
                }
            }
        }

        info!("任务调度循环已停止");
    }

    /// 从每个节点队列和公共队列各取一条消息并分配，返回成功分配的数量
    pub async fn fetch_once(&self) -> SchedulerResult<usize> {
        self.requeue_released().await?;

        let mut queue_keys: Vec<String> = self
            .repos
            .nodes
            .list()
            .await?
            .iter()
            .map(|node| node_queue_key(&node.key))
            .collect();
        queue_keys.push(PUBLIC_QUEUE.to_string());

        let mut assigned = 0;
        for queue_key in &queue_keys {
            let Some(message) = self.queue.pop(queue_key).await? else {
                continue;
            };
            if self.handle_message(queue_key, message).await? {
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    async fn handle_message(&self, queue_key: &str, message: TaskMessage) -> SchedulerResult<bool> {
        let Some(task) = self.repos.tasks.get_by_id(message.task_id).await? else {
            warn!("队列 {} 中的任务 {} 不存在，丢弃", queue_key, message.task_id);
            return Ok(false);
        };

        if task.status != TaskStatus::Pending {
            debug!(
                "任务 {} 状态为 {:?}，不再分配，丢弃队列消息",
                task.id, task.status
            );
            return Ok(false);
        }

        let priority = task.priority;
        match self.assign(task).await {
            Ok(()) => {
                metrics::counter!(metric_names::TASKS_ASSIGNED).increment(1);
                Ok(true)
            }
            Err(e) => {
                warn!("任务 {} 分配失败，重新入队: {}", message.task_id, e);
                self.queue.push(queue_key, message, priority).await?;
                metrics::counter!(metric_names::TASKS_REQUEUED).increment(1);
                Ok(false)
            }
        }
    }

    /// 把被节点释放的任务放回原队列，已被接手或已结束的任务不再跟踪
    ///
    /// 返回重新入队的数量。
    pub async fn requeue_released(&self) -> SchedulerResult<usize> {
        let pending: Vec<(Uuid, Dispatched)> = self
            .dispatched
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        let mut requeued = 0;
        for (task_id, entry) in pending {
            let task = self.repos.tasks.get_by_id(task_id).await?;
            match task {
                Some(mut task) if task.status == TaskStatus::Pending => {
                    if task.node_id.is_some() {
                        continue;
                    }
                    task.node_id = entry.node_id.clone();
                    self.repos.tasks.save(&task).await?;
                    self.queue
                        .push(&entry.queue_key, TaskMessage::from(&task), task.priority)
                        .await?;
                    metrics::counter!(metric_names::TASKS_REQUEUED).increment(1);
                    info!("任务 {} 被节点退回，重新入队 {}", task_id, entry.queue_key);
                    requeued += 1;
                }
                _ => {}
            }
            self.dispatched.lock().await.remove(&task_id);
        }
        Ok(requeued)
    }

    async fn track_dispatched(&self, task_id: Uuid, queue_key: String, node_id: Option<String>) {
        self.dispatched
            .lock()
            .await
            .insert(task_id, Dispatched { queue_key, node_id });
    }

    /// 占用节点的一个空闲名额，失败只影响调度精度
    async fn reserve_runner(&self, node_key: &str) {
        if let Err(e) = self.repos.nodes.reserve_runner(node_key).await {
            warn!("更新节点 {} 的空闲Runner数失败: {}", node_key, e);
        }
    }

    /// 按运行模式把任务分配到节点
    pub async fn assign(&self, task: Task) -> SchedulerResult<()> {
        let nodes = self.repos.nodes.list().await?;
        let targets = self.selector.select(&task, &nodes)?;

        match task.mode {
            RunMode::SingleNode | RunMode::RandomNode => {
                let target = targets
                    .into_iter()
                    .next()
                    .ok_or(SchedulerError::NoEligibleNode { task_id: task.id })?;
                self.assign_single(task, target).await
            }
            RunMode::AllNodes | RunMode::SelectedNodes => self.assign_multi(task, targets).await,
        }
    }

    async fn assign_single(&self, mut task: Task, node_key: String) -> SchedulerResult<()> {
        let previous = task.node_id.replace(node_key.clone());
        self.repos.tasks.save(&task).await?;

        if let Err(e) = self
            .node_service
            .send(&node_key, StreamMessage::run(&node_key, task.id))
            .await
        {
            task.node_id = previous;
            self.repos.tasks.save(&task).await?;
            return Err(e);
        }

        self.reserve_runner(&node_key).await;
        self.track_dispatched(task.id, Self::queue_key_for_node(&task, previous.as_deref()), previous)
            .await;
        info!("任务 {} 已分配到节点 {}", task.id, node_key);
        Ok(())
    }

    async fn assign_multi(&self, mut parent: Task, targets: Vec<String>) -> SchedulerResult<()> {
        let children: Vec<Task> = targets.iter().map(|key| parent.child_for(key)).collect();
        for child in &children {
            self.repos.tasks.save(child).await?;
        }

        parent.status = TaskStatus::Running;
        parent.started_at = Some(Utc::now());
        self.repos.tasks.save(&parent).await?;

        let mut delivered = 0;
        for child in &children {
            let Some(node_key) = child.node_id.as_deref() else {
                continue;
            };
            match self
                .node_service
                .send(node_key, StreamMessage::run(node_key, child.id))
                .await
            {
                Ok(()) => {
                    delivered += 1;
                    self.reserve_runner(node_key).await;
                    self.track_dispatched(
                        child.id,
                        node_queue_key(node_key),
                        Some(node_key.to_string()),
                    )
                    .await;
                }
                Err(e) => {
                    warn!("子任务 {} 发送到节点 {} 失败: {}", child.id, node_key, e);
                    self.repos
                        .tasks
                        .update_status(child.id, TaskStatus::Error, Some(e.to_string()))
                        .await?;
                }
            }
        }

        if delivered == 0 {
            error!("任务 {} 的全部子任务都无法下发", parent.id);
            self.repos
                .tasks
                .update_status(
                    parent.id,
                    TaskStatus::Error,
                    Some("no sub-task could be delivered".to_string()),
                )
                .await?;
        } else {
            info!(
                "任务 {} 拆分为 {} 个子任务，已下发 {} 个",
                parent.id,
                children.len(),
                delivered
            );
        }
        Ok(())
    }

    /// 取消任务
    ///
    /// 等待中的任务直接标记为取消，队列中的消息在出队时丢弃；
    /// 运行中的任务由所在节点终止进程，master不会在本地结束任何进程。
    pub async fn cancel(&self, task_id: Uuid) -> SchedulerResult<()> {
        let task = self
            .repos
            .tasks
            .get_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        if task.is_terminal() {
            return Err(SchedulerError::InvalidTaskState {
                id: task.id,
                status: task.status,
            });
        }

        let children = self.repos.tasks.list_children(task.id).await?;
        if !children.is_empty() {
            return self.cancel_parent(&task, children).await;
        }

        self.cancel_one(&task).await
    }

    async fn cancel_one(&self, task: &Task) -> SchedulerResult<()> {
        match task.status {
            TaskStatus::Pending => {
                let cancelled = self
                    .repos
                    .tasks
                    .update_status_if(task.id, TaskStatus::Pending, TaskStatus::Cancelled, None)
                    .await?;
                if !cancelled {
                    // 节点刚刚接手了任务，按最新状态处理
                    let current = self
                        .repos
                        .tasks
                        .get_by_id(task.id)
                        .await?
                        .ok_or(SchedulerError::TaskNotFound { id: task.id })?;
                    return self.send_cancel(&current).await;
                }
                info!("等待中的任务 {} 已取消", task.id);

                // 已下发但节点尚未启动的任务，通知节点丢弃
                if let Some(node_key) = task.node_id.as_deref() {
                    if let Err(e) = self
                        .node_service
                        .send(node_key, StreamMessage::cancel(node_key, task.id))
                        .await
                    {
                        debug!("通知节点 {} 取消任务 {} 失败: {}", node_key, task.id, e);
                    }
                }
                Ok(())
            }
            _ => self.send_cancel(task).await,
        }
    }

    async fn send_cancel(&self, task: &Task) -> SchedulerResult<()> {
        match (task.status, task.node_id.as_deref()) {
            (TaskStatus::Running, Some(node_key)) => {
                self.node_service
                    .send(node_key, StreamMessage::cancel(node_key, task.id))
                    .await?;
                info!("已向节点 {} 发送任务 {} 的取消请求", node_key, task.id);
                Ok(())
            }
            (status, _) => Err(SchedulerError::InvalidTaskState {
                id: task.id,
                status,
            }),
        }
    }

    async fn cancel_parent(&self, parent: &Task, children: Vec<Task>) -> SchedulerResult<()> {
        for child in children.iter().filter(|child| !child.is_terminal()) {
            if let Err(e) = self.cancel_one(child).await {
                warn!("取消子任务 {} 失败: {}", child.id, e);
            }
        }

        let children = self.repos.tasks.list_children(parent.id).await?;
        if let Some(status) = aggregate_children_status(&children) {
            self.repos
                .tasks
                .update_status(parent.id, status, None)
                .await?;
            info!("父任务 {} 的子任务已全部结束，状态: {:?}", parent.id, status);
        }
        Ok(())
    }
}
