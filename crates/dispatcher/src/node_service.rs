use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use crawlhub_core::models::{Node, NodeIdentity, StreamMessage};
use crawlhub_core::traits::NodeRepository;
use crawlhub_core::{SchedulerError, SchedulerResult};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 节点消息流的master端句柄
///
/// 由消息流处理器在收到 `CONNECT` 后创建并登记到 [`NodeService`]，
/// 断开或取消订阅时移除。
#[derive(Debug, Clone)]
pub struct Subscription {
    id: Uuid,
    sender: mpsc::Sender<StreamMessage>,
    finished: CancellationToken,
}

impl Subscription {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<StreamMessage>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let subscription = Self {
            id: Uuid::new_v4(),
            sender,
            finished: CancellationToken::new(),
        };
        (subscription, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 触发后消息流处理器结束
    pub fn finished(&self) -> &CancellationToken {
        &self.finished
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.finished.is_cancelled()
    }
}

/// master侧节点协调服务：注册、心跳和订阅表
pub struct NodeService {
    nodes: Arc<dyn NodeRepository>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    allowed_nodes: HashSet<String>,
}

impl NodeService {
    pub fn new(nodes: Arc<dyn NodeRepository>, allowed_nodes: Vec<String>) -> Self {
        Self {
            nodes,
            subscriptions: RwLock::new(HashMap::new()),
            allowed_nodes: allowed_nodes.into_iter().collect(),
        }
    }

    /// 注册准入策略，允许列表为空时放行所有节点
    pub fn allow_register(&self, key: &str) -> bool {
        self.allowed_nodes.is_empty() || self.allowed_nodes.contains(key)
    }

    /// 注册节点，首次注册创建记录，重复注册只刷新身份字段
    pub async fn register(&self, identity: &NodeIdentity) -> SchedulerResult<Node> {
        if !self.allow_register(&identity.key) {
            warn!("节点 {} 不在允许注册的列表中", identity.key);
            return Err(SchedulerError::Forbidden(identity.key.clone()));
        }

        let node = match self.nodes.get_by_key(&identity.key).await? {
            Some(mut node) => {
                node.apply_identity(identity);
                node.last_heartbeat_at = Some(Utc::now());
                debug!("节点 {} 重新注册", identity.key);
                node
            }
            None => {
                info!(
                    "新节点注册: {} ({}, max_runners={})",
                    identity.key, identity.ip, identity.max_runners
                );
                Node::new(identity)
            }
        };

        self.nodes.save(&node).await?;
        Ok(node)
    }

    /// 处理心跳，只更新心跳时间
    ///
    /// master记录丢失（例如重启后的内存存储）时按注册流程重建节点。
    pub async fn heartbeat(&self, identity: &NodeIdentity) -> SchedulerResult<()> {
        match self.nodes.update_heartbeat(&identity.key, Utc::now()).await {
            Err(SchedulerError::NodeNotFound { .. }) => {
                warn!("收到未注册节点 {} 的心跳，重新注册", identity.key);
                self.register(identity).await.map(|_| ())
            }
            other => other,
        }
    }

    pub async fn get_subscribe(&self, key: &str) -> Option<Subscription> {
        self.subscriptions.read().await.get(key).cloned()
    }

    /// 登记订阅，后写入者覆盖；被替换的旧订阅不会被主动关闭
    pub async fn set_subscribe(&self, key: &str, subscription: Subscription) {
        let previous = self
            .subscriptions
            .write()
            .await
            .insert(key.to_string(), subscription);
        if previous.is_some() {
            info!("节点 {} 的订阅被新连接替换", key);
        }
    }

    pub async fn delete_subscribe(&self, key: &str) -> Option<Subscription> {
        self.subscriptions.write().await.remove(key)
    }

    /// 仅当当前订阅仍是 `id` 时移除，避免旧连接退出时删掉替换它的新订阅
    pub async fn delete_subscribe_if(&self, key: &str, id: Uuid) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        match subscriptions.get(key) {
            Some(current) if current.id == id => {
                subscriptions.remove(key);
                true
            }
            _ => false,
        }
    }

    /// 节点主动取消订阅：移除订阅并结束对应的消息流
    pub async fn unsubscribe(&self, identity: &NodeIdentity) -> SchedulerResult<()> {
        if let Some(subscription) = self.delete_subscribe(&identity.key).await {
            subscription.finished.cancel();
            info!("节点 {} 取消订阅", identity.key);
        }
        Ok(())
    }

    /// 向节点推送消息
    ///
    /// 节点没有存活的订阅时立即返回 `SubscriptionNotFound`。
    pub async fn send(&self, key: &str, msg: StreamMessage) -> SchedulerResult<()> {
        let not_found = || SchedulerError::SubscriptionNotFound {
            key: key.to_string(),
        };

        let subscription = self.get_subscribe(key).await.ok_or_else(not_found)?;
        if subscription.is_closed() {
            return Err(not_found());
        }

        debug!("向节点 {} 推送 {:?} 消息", key, msg.code);
        subscription.sender.send(msg).await.map_err(|_| not_found())
    }

    /// 结束全部消息流，master关闭时调用
    pub async fn shutdown(&self) {
        let mut subscriptions = self.subscriptions.write().await;
        for (_, subscription) in subscriptions.drain() {
            subscription.finished.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use crawlhub_core::models::{NodeStatus, StreamMessageCode};
    use crawlhub_infrastructure::MemoryStore;
    use crawlhub_testing_utils::NodeBuilder;

    use super::*;

    fn service(allowed: Vec<String>) -> (NodeService, Arc<MemoryStore>) {
        let store = MemoryStore::new();
        (NodeService::new(store.clone(), allowed), store)
    }

    #[tokio::test]
    async fn test_register_creates_then_updates() {
        let (service, store) = service(Vec::new());
        let identity = NodeBuilder::identity("worker-1", 4);

        let node = service.register(&identity).await.unwrap();
        assert_eq!(node.status, NodeStatus::Registered);

        store
            .update_status("worker-1", NodeStatus::Online)
            .await
            .unwrap();
        let again = service
            .register(&NodeBuilder::identity("worker-1", 6))
            .await
            .unwrap();
        assert_eq!(again.status, NodeStatus::Online);
        assert_eq!(again.max_runners, 6);
    }

    #[tokio::test]
    async fn test_register_forbidden_by_policy() {
        let (service, store) = service(vec!["worker-1".to_string()]);

        let err = service
            .register(&NodeBuilder::identity("intruder", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Forbidden(key) if key == "intruder"));
        assert!(store.get_by_key("intruder").await.unwrap().is_none());
        assert!(service.register(&NodeBuilder::identity("worker-1", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_re_registers_unknown_node() {
        let (service, store) = service(Vec::new());
        service
            .heartbeat(&NodeBuilder::identity("worker-2", 2))
            .await
            .unwrap();
        assert!(store.get_by_key("worker-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_send_without_subscription_fails_fast() {
        let (service, _) = service(Vec::new());
        let err = service
            .send("worker-1", StreamMessage::ping("worker-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SubscriptionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let (service, _) = service(Vec::new());
        let (first, mut first_rx) = Subscription::new(4);
        let (second, mut second_rx) = Subscription::new(4);
        let first_id = first.id();
        let second_id = second.id();

        service.set_subscribe("worker-1", first).await;
        service.set_subscribe("worker-1", second).await;
        service
            .send("worker-1", StreamMessage::run("worker-1", Uuid::new_v4()))
            .await
            .unwrap();

        let delivered = second_rx.recv().await.unwrap();
        assert_eq!(delivered.code, StreamMessageCode::Run);
        assert!(first_rx.try_recv().is_err());

        // 旧连接退出不会删掉新订阅
        assert!(!service.delete_subscribe_if("worker-1", first_id).await);
        assert_eq!(
            service.get_subscribe("worker-1").await.unwrap().id(),
            second_id
        );
        assert!(service.delete_subscribe_if("worker-1", second_id).await);
        assert!(service.get_subscribe("worker-1").await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_finishes_stream() {
        let (service, _) = service(Vec::new());
        let (subscription, _rx) = Subscription::new(4);
        let finished = subscription.finished().clone();
        service.set_subscribe("worker-1", subscription).await;

        service
            .unsubscribe(&NodeBuilder::identity("worker-1", 1))
            .await
            .unwrap();
        assert!(finished.is_cancelled());
        assert!(service.get_subscribe("worker-1").await.is_none());
    }

    #[tokio::test]
    async fn test_closed_receiver_counts_as_missing() {
        let (service, _) = service(Vec::new());
        let (subscription, rx) = Subscription::new(4);
        service.set_subscribe("worker-1", subscription).await;
        drop(rx);

        let err = service
            .send("worker-1", StreamMessage::ping("worker-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SubscriptionNotFound { .. }));
    }
}
