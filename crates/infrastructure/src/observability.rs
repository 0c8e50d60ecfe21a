use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// 调度器指标名
pub mod metric_names {
    pub const TASKS_ENQUEUED: &str = "crawlhub_tasks_enqueued_total";
    pub const TASKS_ASSIGNED: &str = "crawlhub_tasks_assigned_total";
    pub const TASKS_REQUEUED: &str = "crawlhub_tasks_requeued_total";
    pub const TASKS_FINISHED: &str = "crawlhub_tasks_finished_total";
    pub const RUNNERS_RUNNING: &str = "crawlhub_runners_running";
    pub const NODES_ONLINE: &str = "crawlhub_nodes_online";
}

/// 安装Prometheus导出器，在 `bind_address` 上提供抓取端点
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}
