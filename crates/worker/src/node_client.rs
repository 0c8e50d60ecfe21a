use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crawlhub_core::{
    models::{NodeIdentity, StreamMessage},
    SchedulerError, SchedulerResult,
};
use crawlhub_infrastructure::{SubscribeStream, TransportClient};

/// worker侧的节点协调客户端：注册、心跳和消息流接收
pub struct NodeClient {
    client: Arc<TransportClient>,
    identity: NodeIdentity,
    heartbeat_interval: Duration,
    resubscribe_interval: Duration,
}

impl NodeClient {
    pub fn new(
        client: Arc<TransportClient>,
        identity: NodeIdentity,
        heartbeat_interval: Duration,
        resubscribe_interval: Duration,
    ) -> Self {
        Self {
            client,
            identity,
            heartbeat_interval,
            resubscribe_interval,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.client
    }

    pub async fn register(&self) -> SchedulerResult<()> {
        self.client.register(&self.identity).await?;
        info!(node_key = %self.identity.key, "Registered with master");
        Ok(())
    }

    pub async fn subscribe(&self, cancel: &CancellationToken) -> SchedulerResult<SubscribeStream> {
        self.client.subscribe(cancel).await
    }

    /// 尽力取消订阅，失败只记录日志
    pub async fn unsubscribe(&self) {
        if let Err(e) = self.client.unsubscribe(&self.identity).await {
            warn!(node_key = %self.identity.key, "Failed to unsubscribe: {}", e);
        }
    }

    /// 心跳循环，直到取消
    pub async fn run_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Heartbeat loop stopped");
                    return;
                }
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
            }

            if let Err(e) = self.client.send_heartbeat(&self.identity).await {
                error!(node_key = %self.identity.key, "Failed to send heartbeat: {}", e);
            }
        }
    }

    /// 接收循环：把消息流中的消息投递到 `sender`
    ///
    /// 服务端正常关闭消息流时永久停止；读取出错时等待 `resubscribe_interval`
    /// 后重新订阅。`sender` 满时投递阻塞。
    pub async fn run_receive(self: Arc<Self>, sender: mpsc::Sender<StreamMessage>, cancel: CancellationToken) {
        loop {
            let mut stream = match self.subscribe(&cancel).await {
                Ok(stream) => stream,
                Err(SchedulerError::Cancelled) => return,
                Err(_) if self.client.is_closed() => return,
                Err(e) => {
                    error!("Failed to subscribe: {}", e);
                    if !self.wait_resubscribe(&cancel).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => {
                        stream.close().await;
                        return;
                    }
                    received = stream.recv() => received,
                };

                match received {
                    Ok(Some(msg)) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = sender.send(msg) => {
                                if sent.is_err() {
                                    debug!("Message consumer dropped, stopping receive loop");
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        info!("Master closed the stream");
                        return;
                    }
                    Err(e) => {
                        if self.client.is_closed() {
                            return;
                        }
                        warn!("Stream receive failed, resubscribing: {}", e);
                        break;
                    }
                }
            }

            if !self.wait_resubscribe(&cancel).await {
                return;
            }
        }
    }

    async fn wait_resubscribe(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.resubscribe_interval) => true,
        }
    }
}
