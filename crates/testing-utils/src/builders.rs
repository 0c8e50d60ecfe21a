//! 测试数据构建器，提供合理默认值

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use crawlhub_core::models::{
    Node, NodeIdentity, NodeStatus, RunMode, Spider, Task, TaskStatus,
};
use uuid::Uuid;

/// 构建测试任务，默认是优先级5的系统命令 `true`
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::system("true"),
        }
    }

    pub fn with_cmd(mut self, cmd: &str) -> Self {
        self.task.cmd = Some(cmd.to_string());
        self
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.task.param = Some(param.to_string());
        self
    }

    pub fn with_spider(mut self, spider_id: Uuid) -> Self {
        self.task.spider_id = Some(spider_id);
        self.task.cmd = None;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.task.mode = mode;
        self
    }

    /// 单节点模式并指定节点
    pub fn pinned_to(mut self, node_key: &str) -> Self {
        self.task.mode = RunMode::SingleNode;
        self.task.node_id = Some(node_key.to_string());
        self
    }

    pub fn with_node_ids(mut self, node_ids: &[&str]) -> Self {
        self.task.mode = RunMode::SelectedNodes;
        self.task.node_ids = node_ids.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.task.parent_id = Some(parent_id);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.task.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 构建测试节点，默认在线、启用、4个Runner全部空闲
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    pub fn new(key: &str) -> Self {
        let mut node = Node::new(&NodeBuilder::identity(key, 4));
        node.status = NodeStatus::Online;
        Self { node }
    }

    /// 与 [`NodeBuilder::new`] 默认值一致的注册身份
    pub fn identity(key: &str, max_runners: u32) -> NodeIdentity {
        NodeIdentity {
            key: key.to_string(),
            name: key.to_string(),
            ip: "127.0.0.1".to_string(),
            is_master: false,
            max_runners,
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.node.status = status;
        self
    }

    pub fn with_capacity(mut self, max_runners: u32, available_runners: u32) -> Self {
        self.node.max_runners = max_runners;
        self.node.available_runners = available_runners;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.node.enabled = false;
        self
    }

    pub fn master(mut self) -> Self {
        self.node.is_master = true;
        self
    }

    pub fn with_last_heartbeat(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.node.last_heartbeat_at = at;
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

pub struct SpiderBuilder {
    spider: Spider,
}

impl SpiderBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            spider: Spider::new("test_spider", cmd),
        }
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.spider.param = Some(param.to_string());
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spider.source_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.spider.env = env;
        self
    }

    pub fn build(self) -> Spider {
        self.spider
    }
}
