use crawlhub_core::models::StreamMessage;
use crawlhub_core::{SchedulerError, SchedulerResult};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// master推送消息流的worker端
///
/// 读取失败不会在这里重试，由调用方决定是否重新订阅。
pub struct SubscribeStream {
    inner: WsStream,
    node_key: String,
}

impl SubscribeStream {
    pub(crate) fn new(inner: WsStream, node_key: String) -> Self {
        Self { inner, node_key }
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    pub async fn send(&mut self, msg: &StreamMessage) -> SchedulerResult<()> {
        let json = msg.serialize()?;
        self.inner
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SchedulerError::Stream(format!("failed to send {:?}: {e}", msg.code)))
    }

    /// 接收下一条消息
    ///
    /// - `Ok(Some(msg))`: 收到消息
    /// - `Ok(None)`: 服务端正常关闭
    /// - `Err(_)`: 连接异常或消息无法解析
    pub async fn recv(&mut self) -> SchedulerResult<Option<StreamMessage>> {
        loop {
            match self.inner.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => {
                    let msg = StreamMessage::deserialize(text.as_str()).map_err(|e| {
                        SchedulerError::Stream(format!("invalid stream message: {e}"))
                    })?;
                    return Ok(Some(msg));
                }
                Some(Ok(other)) => {
                    debug!(node_key = %self.node_key, "Ignoring non-text frame: {:?}", other);
                }
                Some(Err(e)) => return Err(SchedulerError::Stream(e.to_string())),
            }
        }
    }

    /// 主动关闭，错误忽略
    pub async fn close(mut self) {
        let _ = self.inner.close(None).await;
    }
}
