use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crawlhub_core::{
    config::MasterConfig,
    models::{Node, NodeStatus, TaskStatus},
    traits::Repositories,
    SchedulerResult,
};
use crawlhub_infrastructure::observability::metric_names;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 节点监控配置
#[derive(Debug, Clone)]
pub struct NodeMonitorConfig {
    /// 心跳超时时间（秒）
    pub heartbeat_timeout_seconds: i64,
    /// 检测间隔
    pub interval: Duration,
}

impl Default for NodeMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 60,
            interval: Duration::from_secs(15),
        }
    }
}

impl From<&MasterConfig> for NodeMonitorConfig {
    fn from(config: &MasterConfig) -> Self {
        Self {
            heartbeat_timeout_seconds: config.heartbeat_timeout_seconds,
            interval: config.monitor_interval(),
        }
    }
}

/// 本轮检测的状态变化
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub online: Vec<String>,
    pub offline: Vec<String>,
    /// 因节点离线被标记为错误的任务数
    pub failed_tasks: usize,
}

/// 节点在线状态监控
///
/// 只读写节点和任务记录，不与节点通信。
pub struct NodeMonitor {
    repos: Repositories,
    config: NodeMonitorConfig,
}

impl NodeMonitor {
    pub fn new(repos: Repositories, config: Option<NodeMonitorConfig>) -> Self {
        Self {
            repos,
            config: config.unwrap_or_default(),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("启动节点监控循环，间隔 {:?}", self.config.interval);

        loop {
            if let Err(e) = self.check_nodes().await {
                error!("节点状态检测失败: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("收到停止信号，退出节点监控循环");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// 执行一轮检测
    pub async fn check_nodes(&self) -> SchedulerResult<MonitorReport> {
        let now = Utc::now();
        let mut report = MonitorReport::default();
        let mut online = 0usize;
        let nodes = self.repos.nodes.list().await?;

        for node in &nodes {
            let next = self.next_status(node, now);
            if next.unwrap_or(node.status) == NodeStatus::Online {
                online += 1;
            }
            match next {
                Some(NodeStatus::Offline) => {
                    warn!(
                        "节点 {} 心跳超时 (最后心跳: {:?})，标记为离线",
                        node.key, node.last_heartbeat_at
                    );
                    self.repos
                        .nodes
                        .update_status(&node.key, NodeStatus::Offline)
                        .await?;
                    report.failed_tasks += self.fail_running_tasks(&node.key).await?;
                    report.offline.push(node.key.clone());
                }
                Some(status) => {
                    info!("节点 {} 恢复在线", node.key);
                    self.repos.nodes.update_status(&node.key, status).await?;
                    report.online.push(node.key.clone());
                }
                None => {}
            }
        }

        metrics::gauge!(metric_names::NODES_ONLINE).set(online as f64);

        if !report.online.is_empty() || !report.offline.is_empty() {
            debug!(
                "节点检测完成: 上线 {} 个，离线 {} 个",
                report.online.len(),
                report.offline.len()
            );
        }
        Ok(report)
    }

    fn next_status(&self, node: &Node, now: DateTime<Utc>) -> Option<NodeStatus> {
        let expired = node.is_heartbeat_expired(self.config.heartbeat_timeout_seconds, now);
        match (expired, node.status) {
            (true, NodeStatus::Offline) => None,
            (true, _) => Some(NodeStatus::Offline),
            (false, NodeStatus::Online) => None,
            (false, _) => Some(NodeStatus::Online),
        }
    }

    async fn fail_running_tasks(&self, node_key: &str) -> SchedulerResult<usize> {
        let tasks = self
            .repos
            .tasks
            .list_by_node(node_key, TaskStatus::Running)
            .await?;
        for task in &tasks {
            self.repos
                .tasks
                .update_status(task.id, TaskStatus::Error, Some("node offline".to_string()))
                .await?;
        }
        if !tasks.is_empty() {
            warn!("节点 {} 离线，{} 个运行中的任务被标记为错误", node_key, tasks.len());
        }
        Ok(tasks.len())
    }
}
