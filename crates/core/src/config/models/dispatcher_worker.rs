use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// master节点配置：RPC服务、节点监控和任务拉取
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub bind_address: String,
    /// 允许注册的节点key，为空时允许所有节点
    pub allowed_nodes: Vec<String>,
    pub monitor_interval_seconds: u64,
    pub heartbeat_timeout_seconds: i64,
    pub fetch_interval_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8900".to_string(),
            allowed_nodes: Vec::new(),
            monitor_interval_seconds: 15,
            heartbeat_timeout_seconds: 60,
            fetch_interval_ms: 1000,
        }
    }
}

impl MasterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.bind_address.contains(':') {
            return Err(anyhow::anyhow!("绑定地址格式无效，应为 host:port"));
        }

        if self.monitor_interval_seconds == 0 {
            return Err(anyhow::anyhow!("节点监控间隔必须大于0"));
        }

        if self.heartbeat_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳超时时间必须大于0"));
        }

        if self.fetch_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务拉取间隔必须大于0"));
        }

        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }
}

/// worker节点配置：工作目录、日志目录和各个循环的间隔
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workspace_root: PathBuf,
    pub log_root: PathBuf,
    pub heartbeat_interval_seconds: u64,
    pub resubscribe_interval_seconds: u64,
    pub report_interval_seconds: u64,
    pub health_check_interval_ms: u64,
    pub cancel_poll_interval_ms: u64,
    pub exit_watch_timeout_seconds: u64,
    /// 任务结束后保留工作目录
    pub keep_workspace: bool,
    /// 消息流接收缓冲大小
    pub message_buffer: usize,
    /// 注入到每个任务进程的环境变量
    pub env: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("data/workspace"),
            log_root: PathBuf::from("data/logs"),
            heartbeat_interval_seconds: 15,
            resubscribe_interval_seconds: 5,
            report_interval_seconds: 5,
            health_check_interval_ms: 1000,
            cancel_poll_interval_ms: 200,
            exit_watch_timeout_seconds: 15,
            keep_workspace: true,
            message_buffer: 64,
            env: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("工作目录不能为空"));
        }

        if self.log_root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("日志目录不能为空"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.report_interval_seconds == 0 {
            return Err(anyhow::anyhow!("状态上报间隔必须大于0"));
        }

        if self.health_check_interval_ms == 0 || self.cancel_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("健康检查和取消轮询间隔必须大于0"));
        }

        if self.message_buffer == 0 {
            return Err(anyhow::anyhow!("消息缓冲大小必须大于0"));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_secs(self.resubscribe_interval_seconds)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn exit_watch_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_watch_timeout_seconds)
    }
}
