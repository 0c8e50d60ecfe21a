use rand::seq::IndexedRandom;
use tracing::debug;

use crawlhub_core::{
    models::{Node, RunMode, Task},
    SchedulerError, SchedulerResult,
};

/// 按运行模式挑选任务的目标节点
///
/// 返回的节点key列表：单目标模式（single-node、random-node）恰好一个元素，
/// 多目标模式（all-nodes、selected-nodes）每个元素对应一个子任务。
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeSelector;

impl NodeSelector {
    pub fn new() -> Self {
        Self
    }

    pub fn select(&self, task: &Task, nodes: &[Node]) -> SchedulerResult<Vec<String>> {
        let selected: Vec<String> = match task.mode {
            RunMode::SingleNode => self.select_pinned(task, nodes),
            RunMode::RandomNode => self.select_random(nodes),
            RunMode::AllNodes => nodes
                .iter()
                .filter(|node| node.is_schedulable())
                .map(|node| node.key.clone())
                .collect(),
            RunMode::SelectedNodes => task
                .node_ids
                .iter()
                .filter(|key| {
                    nodes
                        .iter()
                        .any(|node| &node.key == *key && node.is_schedulable())
                })
                .cloned()
                .collect(),
        };

        if selected.is_empty() {
            debug!("任务 {} ({:?}) 没有可分配的节点", task.id, task.mode);
            return Err(SchedulerError::NoEligibleNode { task_id: task.id });
        }

        debug!(
            "任务 {} ({:?}) 选择节点: {}",
            task.id,
            task.mode,
            selected.join(",")
        );
        Ok(selected)
    }

    fn select_pinned(&self, task: &Task, nodes: &[Node]) -> Vec<String> {
        let Some(key) = task.node_id.as_deref() else {
            return Vec::new();
        };
        nodes
            .iter()
            .find(|node| node.key == key && node.has_capacity())
            .map(|node| vec![node.key.clone()])
            .unwrap_or_default()
    }

    fn select_random(&self, nodes: &[Node]) -> Vec<String> {
        let candidates: Vec<&Node> = nodes.iter().filter(|node| node.has_capacity()).collect();
        candidates
            .choose(&mut rand::rng())
            .map(|node| vec![node.key.clone()])
            .unwrap_or_default()
    }
}
