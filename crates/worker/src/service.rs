use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crawlhub_core::{
    config::WorkerConfig,
    models::{NodeIdentity, StreamMessage, StreamMessageCode, TaskStatus},
    traits::{LogSinkFactory, ProcessBuilder, Repositories},
    SchedulerError, SchedulerResult,
};
use crawlhub_infrastructure::{FileLogSinkFactory, SystemProcessBuilder, TransportClient};

use crate::node_client::NodeClient;
use crate::runner::{RunnerConfig, RunnerContext};
use crate::runner_service::RunnerService;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// worker节点服务
///
/// 组合 [`NodeClient`] 与 [`RunnerService`]：连接master、注册、启动心跳、
/// 消息接收和状态上报循环，并把 `RUN` / `CANCEL` 消息分派给Runner池。
pub struct WorkerService {
    node_client: Arc<NodeClient>,
    runner_service: Arc<RunnerService>,
    repos: Repositories,
    message_buffer: usize,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    client: Arc<TransportClient>,
    repos: Repositories,
    identity: NodeIdentity,
    config: WorkerConfig,
    log_sinks: Option<Arc<dyn LogSinkFactory>>,
    processes: Option<Arc<dyn ProcessBuilder>>,
}

impl WorkerServiceBuilder {
    pub fn new(client: Arc<TransportClient>, repos: Repositories, identity: NodeIdentity) -> Self {
        Self {
            client,
            repos,
            identity,
            config: WorkerConfig::default(),
            log_sinks: None,
            processes: None,
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// 替换任务日志的存放方式，默认写入 `log_root`
    pub fn log_sinks(mut self, log_sinks: Arc<dyn LogSinkFactory>) -> Self {
        self.log_sinks = Some(log_sinks);
        self
    }

    pub fn processes(mut self, processes: Arc<dyn ProcessBuilder>) -> Self {
        self.processes = Some(processes);
        self
    }

    pub fn build(self) -> WorkerService {
        let log_sinks = self
            .log_sinks
            .unwrap_or_else(|| Arc::new(FileLogSinkFactory::new(self.config.log_root.clone())));
        let processes = self
            .processes
            .unwrap_or_else(|| Arc::new(SystemProcessBuilder::new()));

        let ctx = RunnerContext {
            node_key: self.identity.key.clone(),
            repos: self.repos.clone(),
            log_sinks,
            processes,
            config: RunnerConfig::from(&self.config),
        };
        let runner_service = Arc::new(RunnerService::new(
            ctx,
            self.identity.max_runners,
            self.config.report_interval(),
        ));
        let node_client = Arc::new(NodeClient::new(
            self.client,
            self.identity,
            self.config.heartbeat_interval(),
            self.config.resubscribe_interval(),
        ));

        WorkerService {
            node_client,
            runner_service,
            repos: self.repos,
            message_buffer: self.config.message_buffer,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl WorkerService {
    pub fn node_key(&self) -> &str {
        &self.node_client.identity().key
    }

    pub fn runner_service(&self) -> &Arc<RunnerService> {
        &self.runner_service
    }

    /// 连接master并启动所有后台循环
    ///
    /// 连接按退避策略无限重试，直到成功或服务被停止。
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        info!(node_key = %self.node_key(), "Starting worker service");

        self.node_client.transport().connect(&self.cancel).await?;
        self.node_client.register().await?;

        let (sender, receiver) = mpsc::channel(self.message_buffer);
        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(
            self.node_client.clone().run_heartbeat(self.cancel.clone()),
        ));
        handles.push(tokio::spawn(
            self.node_client
                .clone()
                .run_receive(sender, self.cancel.clone()),
        ));
        handles.push(tokio::spawn(
            self.runner_service
                .clone()
                .report_handler_status(self.cancel.clone()),
        ));
        handles.push(tokio::spawn(self.clone().dispatch_loop(receiver)));

        info!(node_key = %self.node_key(), "Worker service started");
        Ok(())
    }

    async fn dispatch_loop(self: Arc<Self>, mut receiver: mpsc::Receiver<StreamMessage>) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = receiver.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.handle_message(msg).await;
        }
        debug!("Dispatch loop stopped");
    }

    /// 处理master推送的消息
    pub async fn handle_message(&self, msg: StreamMessage) {
        match msg.code {
            StreamMessageCode::Run => match msg.task_id() {
                Ok(task_id) => self.handle_run(task_id).await,
                Err(e) => warn!("Invalid RUN message: {}", e),
            },
            StreamMessageCode::Cancel => match msg.task_id() {
                Ok(task_id) => self.handle_cancel(task_id),
                Err(e) => warn!("Invalid CANCEL message: {}", e),
            },
            StreamMessageCode::Ping => debug!("Received ping from master"),
            code => debug!(?code, "Ignoring stream message"),
        }
    }

    async fn handle_run(&self, task_id: Uuid) {
        match self.runner_service.run(task_id).await {
            Ok(()) => info!(%task_id, "Task accepted"),
            Err(SchedulerError::RunnerAlreadyExists { .. }) => {
                warn!(%task_id, "Task is already running on this node");
            }
            // 名额已满不是任务本身的问题，释放后由master重新入队
            Err(SchedulerError::NoAvailableRunners) => {
                match self.repos.tasks.release(task_id).await {
                    Ok(true) => info!(%task_id, "No free runner, task released back to master"),
                    Ok(false) => debug!(%task_id, "No free runner, task is no longer pending"),
                    Err(e) => error!(%task_id, "Failed to release rejected task: {}", e),
                }
            }
            Err(e) if e.is_admission() => {
                warn!(%task_id, "Task rejected: {}", e);
                if let Err(update_err) = self
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
                    error!(%task_id, "Failed to mark rejected task: {}", update_err);
                }
            }
            Err(e) => error!(%task_id, "Failed to start task: {}", e),
        }
    }

    /// 取消可能需要等待两个退出观察窗口，放到单独的任务中执行
    fn handle_cancel(&self, task_id: Uuid) {
        let runner_service = self.runner_service.clone();
        tokio::spawn(async move {
            match runner_service.cancel(task_id).await {
                Ok(()) => info!(%task_id, "Task cancel completed"),
                Err(e @ SchedulerError::RunnerNotFound { .. }) => warn!(%task_id, "{}", e),
                Err(e) => error!(%task_id, "Failed to cancel task: {}", e),
            }
        });
    }

    /// 停止服务：结束循环、取消运行中的任务、取消订阅并关闭连接
    pub async fn stop(&self) {
        info!(node_key = %self.node_key(), "Stopping worker service");
        self.cancel.cancel();
        self.runner_service.cancel_all().await;

        let transport = self.node_client.transport();
        if transport.is_started() {
            self.node_client.unsubscribe().await;
        }
        transport.close();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        info!(node_key = %self.node_key(), "Worker service stopped");
    }
}
