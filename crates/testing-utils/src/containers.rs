//! 集成测试容器
//!
//! 需要本地Docker，依赖容器的测试统一标记为 `#[ignore]`。

use anyhow::Result;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::{Redis, REDIS_PORT};

/// Redis测试容器
pub struct RedisTestContainer {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    pub url: String,
}

impl RedisTestContainer {
    pub async fn new() -> Result<Self> {
        let container = Redis::default().start().await?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(REDIS_PORT).await?;

        Ok(Self {
            container,
            url: format!("redis://{host}:{port}"),
        })
    }
}
