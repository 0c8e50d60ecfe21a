use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tokio::signal;
use tracing::{error, info, warn};

use crawlhub_core::{init_logging, AppConfig};
use crawlhub_infrastructure::observability::init_metrics;

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    // 加载配置，命令行参数优先
    let mut config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置失败: {}",
            config_path.map(String::as_str).unwrap_or("<默认路径>")
        )
    })?;
    apply_cli_overrides(&mut config, &matches);
    config.validate().context("命令行参数覆盖后的配置无效")?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    info!("启动爬虫集群协调运行时");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }
    info!("运行模式: {mode_str}");

    if config.observability.metrics_enabled {
        init_metrics(&config.observability.metrics_bind_address).context("启动指标导出失败")?;
    }

    let app_mode: AppMode = mode_str.parse()?;
    let app = Arc::new(Application::new(config, app_mode));

    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };
    tokio::pin!(app_handle);

    // 应用启动失败时不再等待信号
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("应用运行失败: {e:#}");
                    Err(e)
                }
                Err(e) => Err(e).context("应用任务异常退出"),
            };
        }
    }

    shutdown_manager.shutdown().await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("应用任务异常退出: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("爬虫集群协调运行时已退出");
    Ok(())
}

fn build_cli() -> Command {
    Command::new("crawlhub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式爬虫集群协调运行时")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时依次尝试默认路径"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["master", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("node-key")
                .long("node-key")
                .value_name("KEY")
                .help("节点唯一标识，默认使用主机名"),
        )
        .arg(
            Arg::new("max-runners")
                .long("max-runners")
                .value_name("N")
                .help("本节点最大并发任务数")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("master-url")
                .long("master-url")
                .value_name("URL")
                .help("master的RPC地址 (仅在worker模式下使用)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
}

/// 用命令行参数覆盖配置
fn apply_cli_overrides(config: &mut AppConfig, matches: &ArgMatches) {
    if let Some(key) = matches.get_one::<String>("node-key") {
        config.node.key = key.clone();
    }
    if let Some(max_runners) = matches.get_one::<u32>("max-runners") {
        config.node.max_runners = *max_runners;
    }
    if let Some(url) = matches.get_one::<String>("master-url") {
        config.transport.master_url = url.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
