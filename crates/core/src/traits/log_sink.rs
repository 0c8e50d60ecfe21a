use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::SchedulerResult;

/// 任务日志输出
///
/// Runner把子进程的stdout/stderr逐行写入，终态时调用一次 `flush`。
/// 两个读取任务会并发写入同一个sink，实现需要自行保证行级原子性。
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_line(&self, line: &str) -> SchedulerResult<()>;

    async fn flush(&self) -> SchedulerResult<()>;
}

/// 按任务创建日志sink
#[async_trait]
pub trait LogSinkFactory: Send + Sync {
    async fn create(&self, task_id: Uuid) -> SchedulerResult<Arc<dyn LogSink>>;
}
