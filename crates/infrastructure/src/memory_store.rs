use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawlhub_core::models::{Node, NodeStatus, Spider, Task, TaskStatus};
use crawlhub_core::traits::{NodeRepository, Repositories, SpiderRepository, TaskRepository};
use crawlhub_core::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use uuid::Uuid;

/// 内存记录存储
///
/// master和all-in-one模式下的记录层，同时实现三个仓储接口。
/// 节点的各个字段分别更新，互不覆盖。
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    spiders: RwLock<HashMap<Uuid, Spider>>,
    nodes: RwLock<HashMap<String, Node>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 以同一个存储实例构建仓储组合
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories::new(self.clone(), self.clone(), self.clone())
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn save(&self, task: &Task) -> SchedulerResult<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> SchedulerResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;

        task.status = status;
        if status.is_terminal() {
            task.finished_at = Some(Utc::now());
        }
        if error.is_some() {
            task.error = error;
        }
        Ok(())
    }

    async fn update_status_if(
        &self,
        id: Uuid,
        expected: TaskStatus,
        status: TaskStatus,
        error: Option<String>,
    ) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        if task.status != expected {
            return Ok(false);
        }

        task.status = status;
        if status.is_terminal() {
            task.finished_at = Some(Utc::now());
        }
        if error.is_some() {
            task.error = error;
        }
        Ok(true)
    }

    async fn mark_running(
        &self,
        id: Uuid,
        node_key: &str,
        started_at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }

        task.status = TaskStatus::Running;
        task.node_id = Some(node_key.to_string());
        task.started_at = Some(started_at);
        Ok(true)
    }

    async fn update_pid(&self, id: Uuid, pid: u32) -> SchedulerResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        task.pid = Some(pid);
        Ok(())
    }

    async fn release(&self, id: Uuid) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.node_id = None;
        Ok(true)
    }

    async fn list_children(&self, parent_id: Uuid) -> SchedulerResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut children: Vec<Task> = tasks
            .values()
            .filter(|t| t.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|t| t.created_at);
        Ok(children)
    }

    async fn list_by_node(&self, node_key: &str, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.status == status && t.node_id.as_deref() == Some(node_key))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SpiderRepository for MemoryStore {
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Spider>> {
        Ok(self.spiders.read().await.get(&id).cloned())
    }

    async fn save(&self, spider: &Spider) -> SchedulerResult<()> {
        self.spiders.write().await.insert(spider.id, spider.clone());
        Ok(())
    }
}

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn get_by_key(&self, key: &str) -> SchedulerResult<Option<Node>> {
        Ok(self.nodes.read().await.get(key).cloned())
    }

    async fn save(&self, node: &Node) -> SchedulerResult<()> {
        self.nodes.write().await.insert(node.key.clone(), node.clone());
        Ok(())
    }

    async fn list(&self) -> SchedulerResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }

    async fn update_status(&self, key: &str, status: NodeStatus) -> SchedulerResult<()> {
        self.with_node(key, |node| node.status = status).await
    }

    async fn update_heartbeat(&self, key: &str, at: DateTime<Utc>) -> SchedulerResult<()> {
        self.with_node(key, |node| node.last_heartbeat_at = Some(at)).await
    }

    async fn update_available_runners(&self, key: &str, available: u32) -> SchedulerResult<()> {
        self.with_node(key, |node| node.available_runners = available.min(node.max_runners))
            .await
    }

    async fn reserve_runner(&self, key: &str) -> SchedulerResult<()> {
        self.with_node(key, |node| node.available_runners = node.available_runners.saturating_sub(1))
            .await
    }
}

impl MemoryStore {
    async fn with_node(&self, key: &str, apply: impl FnOnce(&mut Node)) -> SchedulerResult<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(key).ok_or_else(|| SchedulerError::NodeNotFound {
            key: key.to_string(),
        })?;
        apply(node);
        Ok(())
    }
}
