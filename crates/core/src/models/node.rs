use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 集群节点信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub key: String,
    pub name: String,
    pub ip: String,
    pub is_master: bool,
    pub status: NodeStatus,
    pub enabled: bool,
    pub max_runners: u32,
    pub available_runners: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// 节点状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Registered,
    Online,
    Offline,
}

/// 节点身份，注册、心跳和订阅时携带
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeIdentity {
    pub key: String,
    pub name: String,
    pub ip: String,
    pub is_master: bool,
    pub max_runners: u32,
}

impl Node {
    /// 根据注册身份创建新的节点记录
    pub fn new(identity: &NodeIdentity) -> Self {
        let now = Utc::now();
        Self {
            key: identity.key.clone(),
            name: identity.name.clone(),
            ip: identity.ip.clone(),
            is_master: identity.is_master,
            status: NodeStatus::Registered,
            enabled: true,
            max_runners: identity.max_runners,
            available_runners: identity.max_runners,
            last_heartbeat_at: Some(now),
            registered_at: now,
        }
    }

    /// 重复注册时刷新身份字段，保留状态和心跳
    pub fn apply_identity(&mut self, identity: &NodeIdentity) {
        self.name = identity.name.clone();
        self.ip = identity.ip.clone();
        self.is_master = identity.is_master;
        if self.max_runners != identity.max_runners {
            let running = self.max_runners.saturating_sub(self.available_runners);
            self.max_runners = identity.max_runners;
            self.available_runners = identity.max_runners.saturating_sub(running);
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// 是否可以作为任务执行节点
    pub fn is_schedulable(&self) -> bool {
        self.is_online() && self.enabled && !self.is_master
    }

    /// 是否还有空闲Runner
    pub fn has_capacity(&self) -> bool {
        self.is_schedulable() && self.available_runners > 0
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, timeout_seconds: i64, now: DateTime<Utc>) -> bool {
        match self.last_heartbeat_at {
            Some(at) => (now - at).num_seconds() > timeout_seconds,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(max_runners: u32) -> NodeIdentity {
        NodeIdentity {
            key: "worker-1".to_string(),
            name: "worker-1".to_string(),
            ip: "10.0.0.2".to_string(),
            is_master: false,
            max_runners,
        }
    }

    #[test]
    fn test_new_node_is_registered_with_full_capacity() {
        let node = Node::new(&identity(4));
        assert_eq!(node.status, NodeStatus::Registered);
        assert_eq!(node.available_runners, 4);
        assert!(!node.is_schedulable());
    }

    #[test]
    fn test_apply_identity_keeps_running_count() {
        let mut node = Node::new(&identity(4));
        node.available_runners = 1;
        node.apply_identity(&identity(8));
        assert_eq!(node.max_runners, 8);
        assert_eq!(node.available_runners, 5);
    }

    #[test]
    fn test_heartbeat_expiry() {
        let mut node = Node::new(&identity(1));
        let now = Utc::now();
        node.last_heartbeat_at = Some(now - chrono::Duration::seconds(120));
        assert!(node.is_heartbeat_expired(60, now));
        assert!(!node.is_heartbeat_expired(180, now));
        node.last_heartbeat_at = None;
        assert!(node.is_heartbeat_expired(60, now));
    }
}
