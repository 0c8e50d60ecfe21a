//! 异步测试辅助工具

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

pub struct TestEnv;

impl TestEnv {
    /// 轮询直到条件满足或超时，返回条件是否满足
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }

        condition().await
    }
}
