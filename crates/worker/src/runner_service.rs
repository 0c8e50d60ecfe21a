use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crawlhub_core::{models::TaskStatus, SchedulerError, SchedulerResult};
use crawlhub_infrastructure::observability::metric_names;

use crate::runner::{RunnerContext, TaskRunner};

/// 本节点的Runner池
///
/// 注册表的大小就是正在运行的任务数。
pub struct RunnerService {
    ctx: RunnerContext,
    max_runners: u32,
    report_interval: Duration,
    runners: RwLock<HashMap<Uuid, Arc<TaskRunner>>>,
}

impl RunnerService {
    pub fn new(ctx: RunnerContext, max_runners: u32, report_interval: Duration) -> Self {
        Self {
            ctx,
            max_runners,
            report_interval,
            runners: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_runners(&self) -> u32 {
        self.max_runners
    }

    pub async fn running_count(&self) -> usize {
        self.runners.read().await.len()
    }

    pub async fn available_runners(&self) -> u32 {
        self.max_runners
            .saturating_sub(self.running_count().await as u32)
    }

    pub async fn get_runner(&self, task_id: Uuid) -> Option<Arc<TaskRunner>> {
        self.runners.read().await.get(&task_id).cloned()
    }

    /// 启动任务
    ///
    /// 准入检查和登记在同一次写锁内完成；任务在后台执行，结束后从注册表移除。
    pub async fn run(self: &Arc<Self>, task_id: Uuid) -> SchedulerResult<()> {
        let runner = {
            let mut runners = self.runners.write().await;
            if runners.contains_key(&task_id) {
                return Err(SchedulerError::RunnerAlreadyExists { id: task_id });
            }
            if runners.len() >= self.max_runners as usize {
                return Err(SchedulerError::NoAvailableRunners);
            }
            let runner = Arc::new(TaskRunner::new(task_id, self.ctx.clone()));
            runners.insert(task_id, runner.clone());
            metrics::gauge!(metric_names::RUNNERS_RUNNING).set(runners.len() as f64);
            runner
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.execute(runner).await;
            service.remove(task_id).await;
        });
        Ok(())
    }

    async fn execute(&self, runner: Arc<TaskRunner>) {
        let task_id = runner.task_id();
        if let Err(e) = runner.init().await {
            match e {
                // 已经结束的任务不覆盖其状态
                SchedulerError::InvalidTaskState { status, .. } => {
                    warn!(%task_id, ?status, "Task already finished, skipping");
                }
                e => {
                    error!(%task_id, "Failed to initialize runner: {}", e);
                    if let Err(update_err) = self
                        .ctx
                        .repos
                        .tasks
                        .update_status_if(
                            task_id,
                            TaskStatus::Pending,
                            TaskStatus::Error,
                            Some(e.to_string()),
                        )
                        .await
                    {
                        error!(%task_id, "Failed to mark task as error: {}", update_err);
                    }
                }
            }
            return;
        }

        match runner.run().await {
            Ok(()) => debug!(%task_id, "Runner completed"),
            Err(e) => debug!(%task_id, "Runner ended: {}", e),
        }
    }

    async fn remove(&self, task_id: Uuid) {
        let mut runners = self.runners.write().await;
        runners.remove(&task_id);
        metrics::gauge!(metric_names::RUNNERS_RUNNING).set(runners.len() as f64);
    }

    /// 取消本节点上正在运行的任务
    pub async fn cancel(&self, task_id: Uuid) -> SchedulerResult<()> {
        let runner = self
            .get_runner(task_id)
            .await
            .ok_or(SchedulerError::RunnerNotFound { id: task_id })?;
        runner.cancel().await
    }

    /// 取消全部任务，关闭时调用
    pub async fn cancel_all(&self) {
        let runners: Vec<Arc<TaskRunner>> = self.runners.read().await.values().cloned().collect();
        if runners.is_empty() {
            return;
        }

        info!("Cancelling {} running tasks", runners.len());
        for runner in runners {
            if let Err(e) = runner.cancel().await {
                warn!(task_id = %runner.task_id(), "Failed to cancel task: {}", e);
            }
        }
    }

    /// 把空闲Runner数写入本节点记录
    pub async fn report_once(&self) -> SchedulerResult<u32> {
        let available = self.available_runners().await;
        self.ctx
            .repos
            .nodes
            .update_available_runners(&self.ctx.node_key, available)
            .await?;
        Ok(available)
    }

    /// 周期性上报空闲Runner数，直到取消
    pub async fn report_handler_status(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if let Err(e) = self.report_once().await {
                warn!("Failed to report runner status: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Runner status report loop stopped");
                    break;
                }
                _ = tokio::time::sleep(self.report_interval) => {}
            }
        }
    }
}
