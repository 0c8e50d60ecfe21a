//! 协作接口的测试替身

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crawlhub_core::traits::{CommandSpec, LogSink, LogSinkFactory, ProcessBuilder};
use crawlhub_core::SchedulerResult;
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

/// 把日志行保存在内存中
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<String>>,
    flushed: AtomicBool,
}

impl MemoryLogSink {
    pub async fn lines(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write_line(&self, line: &str) -> SchedulerResult<()> {
        self.lines.lock().await.push(line.to_string());
        Ok(())
    }

    async fn flush(&self) -> SchedulerResult<()> {
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// 记录每个任务创建的 [`MemoryLogSink`]
#[derive(Debug, Default)]
pub struct MemoryLogSinkFactory {
    sinks: Mutex<Vec<(Uuid, Arc<MemoryLogSink>)>>,
}

impl MemoryLogSinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn sink_for(&self, task_id: Uuid) -> Option<Arc<MemoryLogSink>> {
        self.sinks
            .lock()
            .await
            .iter()
            .find(|(id, _)| *id == task_id)
            .map(|(_, sink)| sink.clone())
    }
}

#[async_trait]
impl LogSinkFactory for MemoryLogSinkFactory {
    async fn create(&self, task_id: Uuid) -> SchedulerResult<Arc<dyn LogSink>> {
        let sink = Arc::new(MemoryLogSink::default());
        self.sinks.lock().await.push((task_id, sink.clone()));
        Ok(sink)
    }
}

/// 包装真实的进程构建器，但存活检查总是报告进程不存在
///
/// 用于模拟进程在未被观察到退出的情况下消失。
pub struct VanishingProcessBuilder {
    inner: Arc<dyn ProcessBuilder>,
}

impl VanishingProcessBuilder {
    pub fn new(inner: Arc<dyn ProcessBuilder>) -> Self {
        Self { inner }
    }
}

impl ProcessBuilder for VanishingProcessBuilder {
    fn build_command(&self, spec: &CommandSpec) -> Command {
        self.inner.build_command(spec)
    }

    fn set_process_group(&self, cmd: &mut Command) {
        self.inner.set_process_group(cmd)
    }

    fn kill_tree(&self, pid: u32, force: bool) -> SchedulerResult<()> {
        self.inner.kill_tree(pid, force)
    }

    fn pid_exists(&self, _pid: u32) -> bool {
        false
    }

    fn group_exists(&self, _pgid: u32) -> bool {
        false
    }
}

/// 包装真实的进程构建器，但信号发送全部被忽略，进程无法被取消
pub struct UnkillableProcessBuilder {
    inner: Arc<dyn ProcessBuilder>,
}

impl UnkillableProcessBuilder {
    pub fn new(inner: Arc<dyn ProcessBuilder>) -> Self {
        Self { inner }
    }
}

impl ProcessBuilder for UnkillableProcessBuilder {
    fn build_command(&self, spec: &CommandSpec) -> Command {
        self.inner.build_command(spec)
    }

    fn set_process_group(&self, cmd: &mut Command) {
        self.inner.set_process_group(cmd)
    }

    fn kill_tree(&self, _pid: u32, _force: bool) -> SchedulerResult<()> {
        Ok(())
    }

    fn pid_exists(&self, pid: u32) -> bool {
        self.inner.pid_exists(pid)
    }

    fn group_exists(&self, pgid: u32) -> bool {
        self.inner.group_exists(pgid)
    }
}
