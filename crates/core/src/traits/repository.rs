//! 记录层接口定义
//!
//! 协调核心只通过这三个接口读写持久化记录：
//! - 任务仓储接口 (TaskRepository)
//! - 爬虫仓储接口 (SpiderRepository)
//! - 节点仓储接口 (NodeRepository)
//!
//! ## 并发写入
//!
//! 节点记录同时被心跳路径（master侧）和Runner容量上报路径（worker侧）修改，
//! 因此 `NodeRepository` 只暴露按字段更新的方法，两个写入方互不覆盖对方的字段。
//!
//! ## 实现
//!
//! - 内存实现（master 与 all-in-one 模式）
//! - 远程委托实现（worker 通过 RPC 把操作转发给 master）

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Node, NodeStatus, Spider, Task, TaskStatus};
use crate::SchedulerResult;

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 根据ID获取任务
    ///
    /// 找到任务时返回 `Some(Task)`，未找到时返回 `None`。
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Task>>;

    /// 保存任务（不存在则创建，存在则整体覆盖）
    async fn save(&self, task: &Task) -> SchedulerResult<()>;

    /// 更新任务状态
    ///
    /// 进入终态时同时写入 `finished_at`；`error` 为 `Some` 时覆盖错误信息。
    ///
    /// # 错误
    ///
    /// * `TaskNotFound` - 任务不存在
    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> SchedulerResult<()>;

    /// 仅当任务当前处于 `expected` 状态时更新状态，返回是否已更新
    ///
    /// 写入终态的一方使用此方法，已经处于终态的记录不会被覆盖。
    async fn update_status_if(
        &self,
        id: Uuid,
        expected: TaskStatus,
        status: TaskStatus,
        error: Option<String>,
    ) -> SchedulerResult<bool>;

    /// `Pending -> Running`，同时写入执行节点和开始时间
    ///
    /// 任务不再是 `Pending`（例如已被取消）时返回 `false`，记录保持不变。
    async fn mark_running(
        &self,
        id: Uuid,
        node_key: &str,
        started_at: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 只更新 `pid` 字段
    async fn update_pid(&self, id: Uuid, pid: u32) -> SchedulerResult<()>;

    /// 节点拒绝执行时释放任务：仍为 `Pending` 的任务清空 `node_id`，返回是否已释放
    async fn release(&self, id: Uuid) -> SchedulerResult<bool>;

    /// 获取父任务拆分出的全部子任务
    async fn list_children(&self, parent_id: Uuid) -> SchedulerResult<Vec<Task>>;

    /// 获取某个节点上处于指定状态的任务
    async fn list_by_node(&self, node_key: &str, status: TaskStatus) -> SchedulerResult<Vec<Task>>;
}

/// 爬虫仓储接口
#[async_trait]
pub trait SpiderRepository: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Spider>>;

    async fn save(&self, spider: &Spider) -> SchedulerResult<()>;
}

/// 节点仓储接口
#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn get_by_key(&self, key: &str) -> SchedulerResult<Option<Node>>;

    /// 保存完整节点记录，仅用于注册
    async fn save(&self, node: &Node) -> SchedulerResult<()>;

    async fn list(&self) -> SchedulerResult<Vec<Node>>;

    /// 只更新 `status` 字段
    async fn update_status(&self, key: &str, status: NodeStatus) -> SchedulerResult<()>;

    /// 只更新 `last_heartbeat_at` 字段
    async fn update_heartbeat(&self, key: &str, at: DateTime<Utc>) -> SchedulerResult<()>;

    /// 只更新 `available_runners` 字段
    async fn update_available_runners(&self, key: &str, available: u32) -> SchedulerResult<()>;

    /// `available_runners` 减一（不低于0），任务分配到节点时占用一个名额
    async fn reserve_runner(&self, key: &str) -> SchedulerResult<()>;
}

/// 三个仓储的组合，按构造函数注入传递
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Arc<dyn TaskRepository>,
    pub spiders: Arc<dyn SpiderRepository>,
    pub nodes: Arc<dyn NodeRepository>,
}

impl Repositories {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        spiders: Arc<dyn SpiderRepository>,
        nodes: Arc<dyn NodeRepository>,
    ) -> Self {
        Self {
            tasks,
            spiders,
            nodes,
        }
    }
}
