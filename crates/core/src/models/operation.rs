use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Node, NodeStatus, Spider, Task, TaskStatus};
use crate::traits::Repositories;
use crate::SchedulerResult;

/// 记录操作委托
///
/// worker进程不直接访问存储，而是把每次仓储调用编码为一个 `ModelOperation`
/// 经 `/rpc/model` 发送给master，由master在本地仓储上执行 [`ModelOperation::apply`]。
/// 返回值统一编码为JSON，调用方再按期望类型解码。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ModelOperation {
    GetTask {
        id: Uuid,
    },
    SaveTask {
        task: Task,
    },
    UpdateTaskStatus {
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    },
    UpdateTaskStatusIf {
        id: Uuid,
        expected: TaskStatus,
        status: TaskStatus,
        error: Option<String>,
    },
    MarkTaskRunning {
        id: Uuid,
        node_key: String,
        started_at: DateTime<Utc>,
    },
    UpdateTaskPid {
        id: Uuid,
        pid: u32,
    },
    ReleaseTask {
        id: Uuid,
    },
    ListChildTasks {
        parent_id: Uuid,
    },
    ListNodeTasks {
        node_key: String,
        status: TaskStatus,
    },
    GetSpider {
        id: Uuid,
    },
    SaveSpider {
        spider: Spider,
    },
    GetNode {
        key: String,
    },
    SaveNode {
        node: Node,
    },
    ListNodes,
    UpdateNodeStatus {
        key: String,
        status: NodeStatus,
    },
    UpdateNodeHeartbeat {
        key: String,
        at: DateTime<Utc>,
    },
    UpdateAvailableRunners {
        key: String,
        available: u32,
    },
    ReserveRunner {
        key: String,
    },
}

impl ModelOperation {
    /// 在给定仓储上执行操作
    pub async fn apply(self, repos: &Repositories) -> SchedulerResult<Value> {
        let value = match self {
            ModelOperation::GetTask { id } => serde_json::to_value(repos.tasks.get_by_id(id).await?)?,
            ModelOperation::SaveTask { task } => {
                repos.tasks.save(&task).await?;
                Value::Null
            }
            ModelOperation::UpdateTaskStatus { id, status, error } => {
                repos.tasks.update_status(id, status, error).await?;
                Value::Null
            }
            ModelOperation::UpdateTaskStatusIf {
                id,
                expected,
                status,
                error,
            } => Value::Bool(repos.tasks.update_status_if(id, expected, status, error).await?),
            ModelOperation::MarkTaskRunning {
                id,
                node_key,
                started_at,
            } => Value::Bool(repos.tasks.mark_running(id, &node_key, started_at).await?),
            ModelOperation::UpdateTaskPid { id, pid } => {
                repos.tasks.update_pid(id, pid).await?;
                Value::Null
            }
            ModelOperation::ReleaseTask { id } => Value::Bool(repos.tasks.release(id).await?),
            ModelOperation::ListChildTasks { parent_id } => {
                serde_json::to_value(repos.tasks.list_children(parent_id).await?)?
            }
            ModelOperation::ListNodeTasks { node_key, status } => {
                serde_json::to_value(repos.tasks.list_by_node(&node_key, status).await?)?
            }
            ModelOperation::GetSpider { id } => {
                serde_json::to_value(repos.spiders.get_by_id(id).await?)?
            }
            ModelOperation::SaveSpider { spider } => {
                repos.spiders.save(&spider).await?;
                Value::Null
            }
            ModelOperation::GetNode { key } => {
                serde_json::to_value(repos.nodes.get_by_key(&key).await?)?
            }
            ModelOperation::SaveNode { node } => {
                repos.nodes.save(&node).await?;
                Value::Null
            }
            ModelOperation::ListNodes => serde_json::to_value(repos.nodes.list().await?)?,
            ModelOperation::UpdateNodeStatus { key, status } => {
                repos.nodes.update_status(&key, status).await?;
                Value::Null
            }
            ModelOperation::UpdateNodeHeartbeat { key, at } => {
                repos.nodes.update_heartbeat(&key, at).await?;
                Value::Null
            }
            ModelOperation::UpdateAvailableRunners { key, available } => {
                repos.nodes.update_available_runners(&key, available).await?;
                Value::Null
            }
            ModelOperation::ReserveRunner { key } => {
                repos.nodes.reserve_runner(&key).await?;
                Value::Null
            }
        };
        Ok(value)
    }

    /// 操作名称，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            ModelOperation::GetTask { .. } => "get_task",
            ModelOperation::SaveTask { .. } => "save_task",
            ModelOperation::UpdateTaskStatus { .. } => "update_task_status",
            ModelOperation::UpdateTaskStatusIf { .. } => "update_task_status_if",
            ModelOperation::MarkTaskRunning { .. } => "mark_task_running",
            ModelOperation::UpdateTaskPid { .. } => "update_task_pid",
            ModelOperation::ReleaseTask { .. } => "release_task",
            ModelOperation::ListChildTasks { .. } => "list_child_tasks",
            ModelOperation::ListNodeTasks { .. } => "list_node_tasks",
            ModelOperation::GetSpider { .. } => "get_spider",
            ModelOperation::SaveSpider { .. } => "save_spider",
            ModelOperation::GetNode { .. } => "get_node",
            ModelOperation::SaveNode { .. } => "save_node",
            ModelOperation::ListNodes => "list_nodes",
            ModelOperation::UpdateNodeStatus { .. } => "update_node_status",
            ModelOperation::UpdateNodeHeartbeat { .. } => "update_node_heartbeat",
            ModelOperation::UpdateAvailableRunners { .. } => "update_available_runners",
            ModelOperation::ReserveRunner { .. } => "reserve_runner",
        }
    }
}
