use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawlhub_core::models::{ModelOperation, Node, NodeStatus, Spider, Task, TaskStatus};
use crawlhub_core::traits::{NodeRepository, Repositories, SpiderRepository, TaskRepository};
use crawlhub_core::{SchedulerError, SchedulerResult};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::transport::TransportClient;

/// worker侧仓储：把每次调用编码为 [`ModelOperation`] 转发给master执行
pub struct RemoteRepository {
    client: Arc<TransportClient>,
}

impl RemoteRepository {
    pub fn new(client: Arc<TransportClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }

    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories::new(self.clone(), self.clone(), self.clone())
    }

    async fn call<T: DeserializeOwned>(&self, op: ModelOperation) -> SchedulerResult<T> {
        let name = op.name();
        let value = self.client.call_model(&op).await?;
        serde_json::from_value(value).map_err(|e| {
            SchedulerError::Serialization(format!("invalid result for {name}: {e}"))
        })
    }

    async fn exec(&self, op: ModelOperation) -> SchedulerResult<()> {
        self.client.call_model(&op).await.map(|_| ())
    }
}

#[async_trait]
impl TaskRepository for RemoteRepository {
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        self.call(ModelOperation::GetTask { id }).await
    }

    async fn save(&self, task: &Task) -> SchedulerResult<()> {
        self.exec(ModelOperation::SaveTask { task: task.clone() }).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> SchedulerResult<()> {
        self.exec(ModelOperation::UpdateTaskStatus { id, status, error })
            .await
    }

    async fn update_status_if(
        &self,
        id: Uuid,
        expected: TaskStatus,
        status: TaskStatus,
        error: Option<String>,
    ) -> SchedulerResult<bool> {
        self.call(ModelOperation::UpdateTaskStatusIf {
            id,
            expected,
            status,
            error,
        })
        .await
    }

    async fn mark_running(
        &self,
        id: Uuid,
        node_key: &str,
        started_at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.call(ModelOperation::MarkTaskRunning {
            id,
            node_key: node_key.to_string(),
            started_at,
        })
        .await
    }

    async fn update_pid(&self, id: Uuid, pid: u32) -> SchedulerResult<()> {
        self.exec(ModelOperation::UpdateTaskPid { id, pid }).await
    }

    async fn release(&self, id: Uuid) -> SchedulerResult<bool> {
        self.call(ModelOperation::ReleaseTask { id }).await
    }

    async fn list_children(&self, parent_id: Uuid) -> SchedulerResult<Vec<Task>> {
        self.call(ModelOperation::ListChildTasks { parent_id }).await
    }

    async fn list_by_node(&self, node_key: &str, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        self.call(ModelOperation::ListNodeTasks {
            node_key: node_key.to_string(),
            status,
        })
        .await
    }
}

#[async_trait]
impl SpiderRepository for RemoteRepository {
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Spider>> {
        self.call(ModelOperation::GetSpider { id }).await
    }

    async fn save(&self, spider: &Spider) -> SchedulerResult<()> {
        self.exec(ModelOperation::SaveSpider {
            spider: spider.clone(),
        })
        .await
    }
}

#[async_trait]
impl NodeRepository for RemoteRepository {
    async fn get_by_key(&self, key: &str) -> SchedulerResult<Option<Node>> {
        self.call(ModelOperation::GetNode {
            key: key.to_string(),
        })
        .await
    }

    async fn save(&self, node: &Node) -> SchedulerResult<()> {
        self.exec(ModelOperation::SaveNode { node: node.clone() })
            .await
    }

    async fn list(&self) -> SchedulerResult<Vec<Node>> {
        self.call(ModelOperation::ListNodes).await
    }

    async fn update_status(&self, key: &str, status: NodeStatus) -> SchedulerResult<()> {
        self.exec(ModelOperation::UpdateNodeStatus {
            key: key.to_string(),
            status,
        })
        .await
    }

    async fn update_heartbeat(&self, key: &str, at: DateTime<Utc>) -> SchedulerResult<()> {
        self.exec(ModelOperation::UpdateNodeHeartbeat {
            key: key.to_string(),
            at,
        })
        .await
    }

    async fn update_available_runners(&self, key: &str, available: u32) -> SchedulerResult<()> {
        self.exec(ModelOperation::UpdateAvailableRunners {
            key: key.to_string(),
            available,
        })
        .await
    }

    async fn reserve_runner(&self, key: &str) -> SchedulerResult<()> {
        self.exec(ModelOperation::ReserveRunner {
            key: key.to_string(),
        })
        .await
    }
}
