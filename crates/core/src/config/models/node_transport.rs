use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 本节点身份
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 节点唯一标识，为空时由启动流程使用主机名填充
    pub key: String,
    pub name: String,
    pub ip: String,
    pub max_runners: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            name: String::new(),
            ip: "127.0.0.1".to_string(),
            max_runners: 8,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_runners == 0 {
            return Err(anyhow::anyhow!("最大Runner数必须大于0"));
        }

        if self.ip.is_empty() {
            return Err(anyhow::anyhow!("IP地址不能为空"));
        }

        Ok(())
    }
}

/// 指数退避参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// 抖动比例，0 表示不抖动
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_interval_ms == 0 {
            return Err(anyhow::anyhow!("退避初始间隔必须大于0"));
        }

        if self.max_interval_ms < self.initial_interval_ms {
            return Err(anyhow::anyhow!("退避最大间隔不能小于初始间隔"));
        }

        if self.multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1"));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(anyhow::anyhow!("退避抖动比例必须在0到1之间"));
        }

        Ok(())
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// master连接参数，worker侧使用；master侧用 `auth_key` 校验请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub master_url: String,
    pub auth_key: String,
    pub request_timeout_seconds: u64,
    pub backoff: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            master_url: "http://127.0.0.1:8900".to_string(),
            auth_key: "crawlhub".to_string(),
            request_timeout_seconds: 30,
            backoff: BackoffConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.master_url.starts_with("http://") && !self.master_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "master地址必须以http://或https://开头: {}",
                self.master_url
            ));
        }

        if self.auth_key.is_empty() {
            return Err(anyhow::anyhow!("认证密钥不能为空"));
        }

        if self.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("请求超时时间必须大于0"));
        }

        self.backoff.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}
