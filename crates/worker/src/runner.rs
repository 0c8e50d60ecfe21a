//! 单个任务的执行器
//!
//! 每个 [`TaskRunner`] 负责一个任务从启动到结束的全过程：
//!
//! ```text
//! init ──> run ──> {Finished, Error, Cancelled} ──> dispose
//! ```
//!
//! 进程结束的原因通过容量为3的信号通道汇报，写入方只使用 `try_send`，
//! `run` 只消费第一个信号：
//!
//! - 等待任务：退出码0为 `Finish`，被信号终止为 `Cancel`，其余为 `Error`
//! - 健康检查：进程在没有被观察到退出的情况下消失时为 `Lost`
//! - 取消：向进程组发送信号，结果经等待任务以 `Cancel` 体现

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crawlhub_core::{
    config::WorkerConfig,
    models::{aggregate_children_status, Spider, Task, TaskStatus},
    traits::{CommandSpec, LogSink, LogSinkFactory, ProcessBuilder, Repositories},
    SchedulerError, SchedulerResult,
};
use crawlhub_infrastructure::observability::metric_names;

use crate::file_sync::sync_dir;

const SIGNAL_CAPACITY: usize = 3;

/// 进程结束原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerSignal {
    Finish,
    Cancel,
    Error(String),
    Lost,
}

impl RunnerSignal {
    /// 由子进程的退出状态得到信号
    pub fn from_exit(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => RunnerSignal::Finish,
            Some(code) => RunnerSignal::Error(format!("process exited with code {code}")),
            None => RunnerSignal::Cancel,
        }
    }
}

/// Runner的运行参数
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub workspace_root: PathBuf,
    pub health_check_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub exit_watch_timeout: Duration,
    pub keep_workspace: bool,
    pub env: HashMap<String, String>,
}

impl From<&WorkerConfig> for RunnerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            health_check_interval: config.health_check_interval(),
            cancel_poll_interval: config.cancel_poll_interval(),
            exit_watch_timeout: config.exit_watch_timeout(),
            keep_workspace: config.keep_workspace,
            env: config.env.clone(),
        }
    }
}

/// 创建Runner所需的协作者
#[derive(Clone)]
pub struct RunnerContext {
    pub node_key: String,
    pub repos: Repositories,
    pub log_sinks: Arc<dyn LogSinkFactory>,
    pub processes: Arc<dyn ProcessBuilder>,
    pub config: RunnerConfig,
}

/// `init` 的结果，由 `run` 取走
struct Prepared {
    task: Task,
    spider: Option<Spider>,
    workspace: PathBuf,
    sink: Arc<dyn LogSink>,
}

pub struct TaskRunner {
    task_id: Uuid,
    ctx: RunnerContext,
    prepared: Mutex<Option<Prepared>>,
    pid: AtomicU32,
    exited: Arc<AtomicBool>,
    cancel_requested: AtomicBool,
    signal_tx: mpsc::Sender<RunnerSignal>,
    signal_rx: Mutex<mpsc::Receiver<RunnerSignal>>,
}

impl TaskRunner {
    pub fn new(task_id: Uuid, ctx: RunnerContext) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        Self {
            task_id,
            ctx,
            prepared: Mutex::new(None),
            pid: AtomicU32::new(0),
            exited: Arc::new(AtomicBool::new(false)),
            cancel_requested: AtomicBool::new(false),
            signal_tx,
            signal_rx: Mutex::new(signal_rx),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// 子进程pid，进程启动前为 `None`
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn workspace_dir(&self) -> PathBuf {
        self.ctx
            .config
            .workspace_root
            .join("tasks")
            .join(self.task_id.to_string())
    }

    /// 加载任务和爬虫，准备工作目录并打开日志
    pub async fn init(&self) -> SchedulerResult<()> {
        let task = self
            .ctx
            .repos
            .tasks
            .get_by_id(self.task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: self.task_id })?;

        if task.is_terminal() {
            return Err(SchedulerError::InvalidTaskState {
                id: task.id,
                status: task.status,
            });
        }

        let spider = match task.spider_id {
            Some(spider_id) => Some(
                self.ctx
                    .repos
                    .spiders
                    .get_by_id(spider_id)
                    .await?
                    .ok_or(SchedulerError::SpiderNotFound { id: spider_id })?,
            ),
            None => None,
        };

        let workspace = self.workspace_dir();
        tokio::fs::create_dir_all(&workspace).await?;
        if let Some(source_dir) = spider.as_ref().and_then(|s| s.source_dir.as_ref()) {
            sync_dir(source_dir, &workspace).await?;
        }

        let sink = self.ctx.log_sinks.create(self.task_id).await?;

        debug!(task_id = %self.task_id, workspace = %workspace.display(), "Runner initialized");
        *self.prepared.lock().await = Some(Prepared {
            task,
            spider,
            workspace,
            sink,
        });
        Ok(())
    }

    /// 执行任务直到结束
    ///
    /// 正常完成返回 `Ok(())`，其余结束方式返回对应的错误；
    /// 任务记录在返回前已经写入终态。
    pub async fn run(&self) -> SchedulerResult<()> {
        let Prepared {
            mut task,
            spider,
            workspace,
            sink,
        } = self
            .prepared
            .lock()
            .await
            .take()
            .ok_or_else(|| SchedulerError::Internal(format!("runner {} not initialized", self.task_id)))?;

        if self.cancel_requested.load(Ordering::SeqCst) {
            info!(task_id = %self.task_id, "Task cancelled before start");
            let result = self
                .finish(&task, TaskStatus::Pending, RunnerSignal::Cancel)
                .await;
            self.dispose(&workspace).await;
            return result;
        }

        let started_at = Utc::now();
        match self
            .ctx
            .repos
            .tasks
            .mark_running(self.task_id, &self.ctx.node_key, started_at)
            .await
        {
            Ok(true) => {
                task.status = TaskStatus::Running;
                task.node_id = Some(self.ctx.node_key.clone());
                task.started_at = Some(started_at);
            }
            Ok(false) => {
                // 分配之后、启动之前任务已被取消或结束
                info!(task_id = %self.task_id, "Task is no longer pending, not starting");
                self.dispose(&workspace).await;
                return Err(SchedulerError::TaskCancelled);
            }
            Err(e) => {
                let signal = RunnerSignal::Error(format!("failed to mark task running: {e}"));
                let result = self.finish(&task, TaskStatus::Pending, signal).await;
                self.dispose(&workspace).await;
                return result;
            }
        }

        let spec = self.command_spec(&task, spider.as_ref(), &workspace);
        info!(task_id = %self.task_id, command = %spec.command_line, "Starting task process");

        let mut cmd = self.ctx.processes.build_command(&spec);
        self.ctx.processes.set_process_group(&mut cmd);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let signal = RunnerSignal::Error(format!("failed to start process: {e}"));
                let result = self.finish(&task, TaskStatus::Running, signal).await;
                let _ = sink.flush().await;
                self.dispose(&workspace).await;
                return result;
            }
        };

        let pid = child.id().unwrap_or_default();
        self.pid.store(pid, Ordering::SeqCst);
        task.pid = Some(pid);
        // 进程已经启动，记录pid失败时仍然继续监管
        if let Err(e) = self.ctx.repos.tasks.update_pid(self.task_id, pid).await {
            warn!(task_id = %self.task_id, pid, "Failed to record task pid: {}", e);
        }

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, sink.clone()));
        }

        let waiter = {
            let signal_tx = self.signal_tx.clone();
            let exited = self.exited.clone();
            tokio::spawn(async move {
                let signal = match child.wait().await {
                    Ok(status) => RunnerSignal::from_exit(status),
                    Err(e) => RunnerSignal::Error(format!("failed to wait for process: {e}")),
                };
                exited.store(true, Ordering::SeqCst);
                let _ = signal_tx.try_send(signal);
            })
        };

        let health_stop = CancellationToken::new();
        let health = self.spawn_health_check(pid, health_stop.clone());

        // 进程启动后才收到的取消请求在这里补发
        if self.cancel_requested.load(Ordering::SeqCst) {
            if let Err(e) = self.ctx.processes.kill_tree(pid, false) {
                warn!(task_id = %self.task_id, "Failed to signal process: {}", e);
            }
        }

        let signal = self
            .signal_rx
            .lock()
            .await
            .recv()
            .await
            .unwrap_or_else(|| RunnerSignal::Error("signal channel closed".to_string()));
        health_stop.cancel();
        debug!(task_id = %self.task_id, ?signal, "Runner received signal");

        if signal == RunnerSignal::Lost {
            // 不再跟踪的进程组，尽量清理残留
            let _ = self.ctx.processes.kill_tree(pid, true);
            waiter.abort();
        }

        let result = self.finish(&task, TaskStatus::Running, signal).await;

        self.drain_readers(readers).await;
        if let Err(e) = sink.flush().await {
            warn!(task_id = %self.task_id, "Failed to flush task log: {}", e);
        }
        let _ = health.await;

        if let Some(parent_id) = task.parent_id {
            if let Err(e) = self.refresh_parent(parent_id).await {
                warn!(task_id = %self.task_id, %parent_id, "Failed to refresh parent task: {}", e);
            }
        }

        self.dispose(&workspace).await;
        result
    }

    /// 写入终态并把信号转换为返回值
    ///
    /// 只有任务仍处于 `expected` 状态时才写入，已经是终态的记录保持不变。
    async fn finish(
        &self,
        task: &Task,
        expected: TaskStatus,
        signal: RunnerSignal,
    ) -> SchedulerResult<()> {
        let (status, error, result) = match signal {
            RunnerSignal::Finish => (TaskStatus::Finished, None, Ok(())),
            RunnerSignal::Cancel => (TaskStatus::Cancelled, None, Err(SchedulerError::TaskCancelled)),
            RunnerSignal::Error(msg) => (
                TaskStatus::Error,
                Some(msg.clone()),
                Err(SchedulerError::TaskExecution(msg)),
            ),
            RunnerSignal::Lost => {
                let pid = self.pid().unwrap_or_default();
                (
                    TaskStatus::Error,
                    Some(format!("task process lost: pid={pid}")),
                    Err(SchedulerError::ProcessLost { pid }),
                )
            }
        };

        let updated = self
            .ctx
            .repos
            .tasks
            .update_status_if(task.id, expected, status, error)
            .await?;
        if !updated {
            info!(task_id = %task.id, ?status, "Task already left {:?}, keeping stored status", expected);
            return result;
        }
        metrics::counter!(metric_names::TASKS_FINISHED, "status" => format!("{status:?}").to_lowercase())
            .increment(1);

        match status {
            TaskStatus::Finished => info!(task_id = %task.id, "Task finished"),
            TaskStatus::Cancelled => info!(task_id = %task.id, "Task cancelled"),
            _ => error!(task_id = %task.id, "Task failed: {:?}", result),
        }
        result
    }

    /// 取消任务：SIGTERM，超时后SIGKILL，进程组仍有存活进程时返回 `UnableToCancel`
    ///
    /// 任务状态由 `run` 根据进程退出写入，这里不修改。
    pub async fn cancel(&self) -> SchedulerResult<()> {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let Some(pid) = self.pid() else {
            debug!(task_id = %self.task_id, "Cancel requested before process start");
            return Ok(());
        };

        info!(task_id = %self.task_id, pid, "Cancelling task");
        self.ctx.processes.kill_tree(pid, false)?;
        if self.wait_for_exit(pid).await {
            return Ok(());
        }

        warn!(task_id = %self.task_id, pid, "Process still alive after SIGTERM, sending SIGKILL");
        self.ctx.processes.kill_tree(pid, true)?;
        if self.wait_for_exit(pid).await {
            return Ok(());
        }

        Err(SchedulerError::UnableToCancel(format!(
            "task {} (pid {pid}) is still running",
            self.task_id
        )))
    }

    /// 等待组长退出且整个进程组消失
    async fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = tokio::time::Instant::now() + self.ctx.config.exit_watch_timeout;
        loop {
            let leader_gone = self.exited.load(Ordering::SeqCst) || !self.ctx.processes.pid_exists(pid);
            if leader_gone && !self.ctx.processes.group_exists(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.ctx.config.cancel_poll_interval).await;
        }
    }

    fn spawn_health_check(&self, pid: u32, stop: CancellationToken) -> JoinHandle<()> {
        let processes = self.ctx.processes.clone();
        let exited = self.exited.clone();
        let signal_tx = self.signal_tx.clone();
        let interval = self.ctx.config.health_check_interval;
        let task_id = self.task_id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if exited.load(Ordering::SeqCst) || processes.pid_exists(pid) {
                    continue;
                }

                // 给等待任务一个周期汇报退出
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !exited.load(Ordering::SeqCst) {
                    warn!(%task_id, pid, "Task process vanished without exit status");
                    let _ = signal_tx.try_send(RunnerSignal::Lost);
                }
                return;
            }
        })
    }

    async fn drain_readers(&self, readers: Vec<JoinHandle<()>>) {
        let timeout = self.ctx.config.exit_watch_timeout;
        for mut reader in readers {
            if tokio::time::timeout(timeout, &mut reader).await.is_err() {
                debug!(task_id = %self.task_id, "Output reader still open, aborting");
                reader.abort();
            }
        }
    }

    /// 子任务结束后，若兄弟任务也已全部结束，写入父任务的汇总状态
    async fn refresh_parent(&self, parent_id: Uuid) -> SchedulerResult<()> {
        let children = self.ctx.repos.tasks.list_children(parent_id).await?;
        if let Some(status) = aggregate_children_status(&children) {
            self.ctx
                .repos
                .tasks
                .update_status(parent_id, status, None)
                .await?;
            info!(%parent_id, ?status, "Parent task completed");
        }
        Ok(())
    }

    async fn dispose(&self, workspace: &Path) {
        if self.ctx.config.keep_workspace {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            warn!(task_id = %self.task_id, "Failed to remove workspace: {}", e);
        }
    }

    fn command_spec(&self, task: &Task, spider: Option<&Spider>, workspace: &Path) -> CommandSpec {
        let (base, param) = match spider {
            Some(spider) => (
                spider.cmd.clone(),
                task.param.clone().or_else(|| spider.param.clone()),
            ),
            None => (task.cmd.clone().unwrap_or_default(), task.param.clone()),
        };
        let command_line = match param.as_deref().map(str::trim) {
            Some(param) if !param.is_empty() => format!("{base} {param}"),
            _ => base,
        };

        let mut env = vec![
            ("CRAWLHUB_TASK_ID".to_string(), task.id.to_string()),
            ("CRAWLHUB_NODE_KEY".to_string(), self.ctx.node_key.clone()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ];
        if let Some(spider_id) = task.spider_id {
            env.push(("CRAWLHUB_SPIDER_ID".to_string(), spider_id.to_string()));
        }
        env.extend(sorted_env(&self.ctx.config.env));
        if let Some(spider) = spider {
            env.extend(sorted_env(&spider.env));
        }
        env.extend(sorted_env(&task.env));

        CommandSpec {
            command_line,
            cwd: workspace.to_path_buf(),
            env,
        }
    }
}

fn sorted_env(env: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    entries.sort();
    entries
}

/// 逐行读取输出写入日志
///
/// 按字节读取，无法解码的内容做有损转换；读取一直持续到管道关闭，
/// 否则子进程的后续写入会因管道断开而被终止。
fn spawn_reader<R>(reader: R, sink: Arc<dyn LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(trim_line_end(&buf));
                    if let Err(e) = sink.write_line(&line).await {
                        warn!("Failed to write task log line: {}", e);
                    }
                }
                Err(e) => {
                    debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
