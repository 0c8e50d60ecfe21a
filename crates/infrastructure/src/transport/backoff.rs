//! 指数退避重试
//!
//! 每个重试循环都接收一个 [`CancellationToken`]，令牌触发时立即以
//! `SchedulerError::Cancelled` 结束，不会出现无法退出的重试。

use std::future::Future;
use std::time::Duration;

use crawlhub_core::config::BackoffConfig;
use crawlhub_core::{SchedulerError, SchedulerResult};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 带抖动的指数退避计算器
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            current: config.initial_interval(),
        }
    }

    /// 返回下一次等待时间并推进间隔
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let grown = base.as_secs_f64() * self.config.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.config.max_interval().as_secs_f64()));

        if self.config.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::rng().random_range(-self.config.jitter..=self.config.jitter);
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_interval();
    }
}

/// 连接类错误才值得重试，认证和准入错误直接返回
pub fn is_retryable(err: &SchedulerError) -> bool {
    matches!(err, SchedulerError::Connection(_) | SchedulerError::Stream(_))
}

/// 按退避策略无限重试 `op`，直到成功、遇到不可重试的错误或 `cancel` 触发
pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    config: &BackoffConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> SchedulerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    let mut backoff = ExponentialBackoff::new(config);
    let mut attempt: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        attempt += 1;

        let err = tokio::select! {
            _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
            result = op() => match result {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => e,
            },
        };

        let delay = backoff.next_delay();
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_config() -> BackoffConfig {
        BackoffConfig {
            initial_interval_ms: 10,
            max_interval_ms: 40,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = ExponentialBackoff::new(&fast_config());
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 40, 40]);

        backoff.reset();
        assert_eq!(backoff.next_delay().as_millis(), 10);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = BackoffConfig {
            jitter: 0.5,
            ..fast_config()
        };
        let mut backoff = ExponentialBackoff::new(&config);
        let delay = backoff.next_delay().as_secs_f64();
        assert!((0.005..=0.015).contains(&delay), "delay {delay}");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let cancel = CancellationToken::new();

        let result = retry_with_backoff("connect", &fast_config(), &cancel, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SchedulerError::Connection("refused".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_forbidden_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let cancel = CancellationToken::new();

        let result: SchedulerResult<()> = retry_with_backoff("register", &fast_config(), &cancel, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::Forbidden("worker-x".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(SchedulerError::Forbidden(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retry_loop() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result: SchedulerResult<()> = retry_with_backoff("connect", &fast_config(), &cancel, || async {
            Err(SchedulerError::Connection("refused".to_string()))
        })
        .await;

        assert!(matches!(result, Err(SchedulerError::Cancelled)));
    }
}
