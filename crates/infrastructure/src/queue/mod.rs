//! 优先级任务队列
//!
//! 数值越大的优先级越先出队，同优先级按入队顺序（FIFO）。
//! 出队是原子的：并发的多个调度器不会取到同一条消息。

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use crawlhub_core::models::TaskMessage;
use crawlhub_core::SchedulerResult;

pub use memory::InMemoryTaskQueue;
pub use self::redis::RedisTaskQueue;

/// 公共队列，未指定节点的任务进入此队列
pub const PUBLIC_QUEUE: &str = "crawlhub:tasks:public";

/// 指定节点任务的队列key
pub fn node_queue_key(node_key: &str) -> String {
    format!("crawlhub:tasks:nodes:{node_key}")
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, queue_key: &str, message: TaskMessage, priority: i32) -> SchedulerResult<()>;

    /// 取出优先级最高的消息，队列为空时返回 `None`
    async fn pop(&self, queue_key: &str) -> SchedulerResult<Option<TaskMessage>>;

    async fn count(&self, queue_key: &str) -> SchedulerResult<usize>;
}
