use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    dispatcher_worker::{MasterConfig, WorkerConfig},
    message_queue::QueueConfig,
    node_transport::{NodeConfig, TransportConfig},
    observability::ObservabilityConfig,
};

/// 默认配置文件搜索路径
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/crawlhub.toml",
    "crawlhub.toml",
    "/etc/crawlhub/config.toml",
];

/// 系统配置
///
/// 所有分节都带有默认值，配置文件只需写出需要覆盖的字段。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub master: MasterConfig,
    pub worker: WorkerConfig,
    pub transport: TransportConfig,
    pub queue: QueueConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 内置默认值
    /// 2. 配置文件（TOML格式）
    /// 3. 环境变量覆盖（前缀 `CRAWLHUB_`，层级分隔符 `__`，如 `CRAWLHUB_NODE__KEY`）
    ///
    /// 显式指定的配置文件不存在时返回错误；未指定时依次尝试默认路径，都不存在则只用默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {}", path));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS
                    .iter()
                    .find(|path| Path::new(path).exists())
                {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CRAWLHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("master.allowed_nodes"),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 序列化为TOML字符串
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 校验全部分节
    pub fn validate(&self) -> Result<()> {
        self.node.validate().context("节点配置验证失败")?;
        self.master.validate().context("master配置验证失败")?;
        self.worker.validate().context("worker配置验证失败")?;
        self.transport.validate().context("传输层配置验证失败")?;
        self.queue.validate().context("任务队列配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}
