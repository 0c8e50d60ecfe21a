use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务定义
///
/// 一次可调度的执行单元：爬虫运行或任意系统命令。
///
/// # 字段说明
///
/// - `spider_id`: 关联的爬虫，设置时使用爬虫的命令和文件
/// - `cmd`: 系统命令，未关联爬虫时必须设置
/// - `node_id`: 执行节点（单节点模式下为指定节点，分配后为实际节点）
/// - `node_ids`: 指定节点模式下的目标节点列表
/// - `parent_id`: 多节点模式下拆分出的子任务指向父任务
/// - `priority`: 优先级，数值越大越先执行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub spider_id: Option<Uuid>,
    pub cmd: Option<String>,
    pub param: Option<String>,
    pub status: TaskStatus,
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_ids: Vec<String>,
    pub pid: Option<u32>,
    pub parent_id: Option<Uuid>,
    pub priority: i32,
    pub mode: RunMode,
    pub error: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 任务状态
///
/// ```text
/// Pending → Running → Finished
///                   ↘ Error
///                   ↘ Cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

/// 运行模式，决定任务分配到哪些节点
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    SingleNode,
    #[default]
    RandomNode,
    AllNodes,
    SelectedNodes,
}

impl Task {
    /// 创建系统命令任务
    pub fn system(cmd: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            spider_id: None,
            cmd: Some(cmd.into()),
            param: None,
            status: TaskStatus::Pending,
            node_id: None,
            node_ids: Vec::new(),
            pid: None,
            parent_id: None,
            priority: 5,
            mode: RunMode::default(),
            error: None,
            env: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// 创建爬虫任务
    pub fn spider(spider_id: Uuid) -> Self {
        Self {
            spider_id: Some(spider_id),
            cmd: None,
            ..Self::system("")
        }
    }

    /// 为多节点模式创建固定到某个节点的子任务
    pub fn child_for(&self, node_key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            node_id: Some(node_key.to_string()),
            node_ids: Vec::new(),
            pid: None,
            parent_id: Some(self.id),
            mode: RunMode::SingleNode,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 队列中携带的命令描述
    pub fn command_summary(&self) -> String {
        match (&self.spider_id, &self.cmd) {
            (Some(spider_id), _) => format!("spider:{spider_id}"),
            (None, Some(cmd)) => cmd.clone(),
            (None, None) => String::new(),
        }
    }
}

/// 根据子任务计算父任务的终态
///
/// 任一子任务未结束时返回 `None`；否则有错误为 `Error`，其次有取消为 `Cancelled`，
/// 全部完成为 `Finished`。
pub fn aggregate_children_status(children: &[Task]) -> Option<TaskStatus> {
    if children.is_empty() || children.iter().any(|c| !c.is_terminal()) {
        return None;
    }
    if children.iter().any(|c| c.status == TaskStatus::Error) {
        Some(TaskStatus::Error)
    } else if children.iter().any(|c| c.status == TaskStatus::Cancelled) {
        Some(TaskStatus::Cancelled)
    } else {
        Some(TaskStatus::Finished)
    }
}

/// 入队的轻量任务消息，只在入队和取出之间存在
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub cmd: String,
}

impl From<&Task> for TaskMessage {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            cmd: task.command_summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Finished.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_child_task_is_pinned_to_node() {
        let mut parent = Task::system("echo hi");
        parent.mode = RunMode::AllNodes;
        parent.priority = 9;

        let child = parent.child_for("worker-2");
        assert_ne!(child.id, parent.id);
        assert_eq!(child.parent_id, Some(parent.id));
        assert_eq!(child.node_id.as_deref(), Some("worker-2"));
        assert_eq!(child.mode, RunMode::SingleNode);
        assert_eq!(child.priority, 9);
        assert_eq!(child.cmd.as_deref(), Some("echo hi"));
    }

    #[test]
    fn test_parent_status_aggregation() {
        let parent = Task::system("echo hi");
        let mut children: Vec<Task> = ["a", "b", "c"].iter().map(|k| parent.child_for(k)).collect();
        assert_eq!(aggregate_children_status(&children), None);

        for child in children.iter_mut() {
            child.status = TaskStatus::Finished;
        }
        assert_eq!(aggregate_children_status(&children), Some(TaskStatus::Finished));

        children[1].status = TaskStatus::Cancelled;
        assert_eq!(aggregate_children_status(&children), Some(TaskStatus::Cancelled));

        children[2].status = TaskStatus::Error;
        assert_eq!(aggregate_children_status(&children), Some(TaskStatus::Error));

        children[0].status = TaskStatus::Running;
        assert_eq!(aggregate_children_status(&children), None);
        assert_eq!(aggregate_children_status(&[]), None);
    }

    #[test]
    fn test_run_mode_serde_names() {
        let json = serde_json::to_string(&RunMode::SelectedNodes).unwrap();
        assert_eq!(json, "\"selected-nodes\"");
        let mode: RunMode = serde_json::from_str("\"all-nodes\"").unwrap();
        assert_eq!(mode, RunMode::AllNodes);
    }
}
