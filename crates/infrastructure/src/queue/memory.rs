use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use async_trait::async_trait;
use crawlhub_core::models::TaskMessage;
use crawlhub_core::SchedulerResult;
use tokio::sync::Mutex;
use tracing::debug;

use super::TaskQueue;

/// 内存任务队列
///
/// 每个队列key对应一个二叉堆，整体由一把互斥锁保护，适用于单master部署。
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    inner: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<String, BinaryHeap<Entry>>,
    next_seq: u64,
}

#[derive(Debug)]
struct Entry {
    priority: i32,
    seq: Reverse<u64>,
    message: TaskMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, queue_key: &str, message: TaskMessage, priority: i32) -> SchedulerResult<()> {
        let mut state = self.inner.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(queue = queue_key, task_id = %message.task_id, priority, "Task enqueued");
        state
            .queues
            .entry(queue_key.to_string())
            .or_default()
            .push(Entry {
                priority,
                seq: Reverse(seq),
                message,
            });
        Ok(())
    }

    async fn pop(&self, queue_key: &str) -> SchedulerResult<Option<TaskMessage>> {
        let mut state = self.inner.lock().await;
        Ok(state
            .queues
            .get_mut(queue_key)
            .and_then(|heap| heap.pop())
            .map(|entry| entry.message))
    }

    async fn count(&self, queue_key: &str) -> SchedulerResult<usize> {
        let state = self.inner.lock().await;
        Ok(state.queues.get(queue_key).map_or(0, |heap| heap.len()))
    }
}
