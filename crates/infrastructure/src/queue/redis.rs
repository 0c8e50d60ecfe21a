use async_trait::async_trait;
use crawlhub_core::models::TaskMessage;
use crawlhub_core::{SchedulerError, SchedulerResult};
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::debug;

use super::TaskQueue;

/// 同优先级内的序号计数器
const SEQUENCE_KEY: &str = "crawlhub:tasks:seq";

/// 优先级权重，保证高优先级的分数总是大于低优先级
const PRIORITY_WEIGHT: f64 = 1e12;

/// Redis任务队列
///
/// 每个队列是一个有序集合，分数为 `priority × 10¹² − seq`，
/// `ZPOPMAX` 同时给出最高优先级和最早入队的消息，多个master并发出队也是原子的。
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
}

impl RedisTaskQueue {
    pub async fn connect(url: &str) -> SchedulerResult<Self> {
        let client = Client::open(url).map_err(|e| {
            SchedulerError::MessageQueue(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            SchedulerError::MessageQueue(format!("Failed to connect to Redis: {e}"))
        })?;
        debug!("Connected to Redis task queue at {}", url);
        Ok(Self { conn })
    }

    fn score(priority: i32, seq: u64) -> f64 {
        f64::from(priority) * PRIORITY_WEIGHT - seq as f64
    }
}

fn queue_error(op: &str, e: redis::RedisError) -> SchedulerError {
    SchedulerError::MessageQueue(format!("Redis {op} failed: {e}"))
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, queue_key: &str, message: TaskMessage, priority: i32) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        let seq: u64 = redis::cmd("INCR")
            .arg(SEQUENCE_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| queue_error("INCR", e))?;
        let payload = serde_json::to_string(&message)?;

        let _: i64 = redis::cmd("ZADD")
            .arg(queue_key)
            .arg(Self::score(priority, seq))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| queue_error("ZADD", e))?;
        Ok(())
    }

    async fn pop(&self, queue_key: &str) -> SchedulerResult<Option<TaskMessage>> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMAX")
            .arg(queue_key)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| queue_error("ZPOPMAX", e))?;

        match popped.into_iter().next() {
            Some((payload, _score)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn count(&self, queue_key: &str) -> SchedulerResult<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(queue_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| queue_error("ZCARD", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_orders_priority_before_sequence() {
        let high_late = RedisTaskQueue::score(10, 1_000);
        let low_early = RedisTaskQueue::score(5, 1);
        assert!(high_late > low_early);

        let first = RedisTaskQueue::score(5, 1);
        let second = RedisTaskQueue::score(5, 2);
        assert!(first > second);
    }
}
