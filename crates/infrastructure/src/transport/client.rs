use std::sync::atomic::{AtomicU8, Ordering};

use crawlhub_core::config::{BackoffConfig, TransportConfig};
use crawlhub_core::models::{Ack, ModelOperation, NodeIdentity, StreamMessage};
use crawlhub_core::{ErrorBody, SchedulerError, SchedulerResult};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::retry_with_backoff;
use super::stream::SubscribeStream;
use super::{routes, NODE_KEY_HEADER};

/// 客户端状态
///
/// ```text
/// Idle → Connecting → Ready → Shutdown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    Shutdown = 3,
}

impl From<u8> for ClientState {
    fn from(value: u8) -> Self {
        match value {
            0 => ClientState::Idle,
            1 => ClientState::Connecting,
            2 => ClientState::Ready,
            _ => ClientState::Shutdown,
        }
    }
}

/// 连接master的客户端，每个进程一个
pub struct TransportClient {
    http_client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    node_key: String,
    backoff: BackoffConfig,
    state: AtomicU8,
}

impl TransportClient {
    pub fn new(config: &TransportConfig, node_key: impl Into<String>) -> SchedulerResult<Self> {
        let node_key = node_key.into();

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.auth_key))
            .map_err(|e| SchedulerError::Configuration(format!("invalid auth key: {e}")))?;
        let key_value = HeaderValue::from_str(&node_key)
            .map_err(|e| SchedulerError::Configuration(format!("invalid node key: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(NODE_KEY_HEADER, key_value);

        let http_client = reqwest::Client::builder()
            .default_headers(headers.clone())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: config.master_url.trim_end_matches('/').to_string(),
            headers,
            node_key,
            backoff: config.backoff.clone(),
            state: AtomicU8::new(ClientState::Idle as u8),
        })
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    pub fn state(&self) -> ClientState {
        ClientState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn is_started(&self) -> bool {
        self.state() == ClientState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ClientState::Shutdown
    }

    /// 进入 `Shutdown`，之后所有调用都会失败
    pub fn close(&self) {
        self.state.store(ClientState::Shutdown as u8, Ordering::SeqCst);
        debug!(node_key = %self.node_key, "Transport closed");
    }

    /// 探测master直到可达
    ///
    /// 按退避策略无限重试，只在成功或 `cancel` 触发时返回。
    pub async fn connect(&self, cancel: &CancellationToken) -> SchedulerResult<()> {
        self.ensure_open()?;
        let _ = self.state.compare_exchange(
            ClientState::Idle as u8,
            ClientState::Connecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        retry_with_backoff("connect", &self.backoff, cancel, || self.ping()).await?;

        let _ = self.state.compare_exchange(
            ClientState::Connecting as u8,
            ClientState::Ready as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.ensure_open()?;
        info!(master = %self.base_url, node_key = %self.node_key, "Connected to master");
        Ok(())
    }

    async fn ping(&self) -> SchedulerResult<()> {
        let url = format!("{}{}", self.base_url, routes::PING);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| SchedulerError::Connection(format!("ping {url}: {e}")))?;
        Self::decode::<Ack>(response).await.map(|_| ())
    }

    pub async fn register(&self, identity: &NodeIdentity) -> SchedulerResult<()> {
        self.post::<_, Ack>(routes::REGISTER, identity).await?;
        info!(node_key = %identity.key, "Registered with master");
        Ok(())
    }

    pub async fn send_heartbeat(&self, identity: &NodeIdentity) -> SchedulerResult<()> {
        self.post::<_, Ack>(routes::HEARTBEAT, identity).await?;
        debug!(node_key = %identity.key, "Heartbeat sent");
        Ok(())
    }

    pub async fn unsubscribe(&self, identity: &NodeIdentity) -> SchedulerResult<()> {
        self.post::<_, Ack>(routes::UNSUBSCRIBE, identity).await?;
        Ok(())
    }

    /// 委托master执行记录操作
    pub async fn call_model(&self, op: &ModelOperation) -> SchedulerResult<serde_json::Value> {
        self.post(routes::MODEL, op).await
    }

    /// 打开消息流并发送 `CONNECT`
    ///
    /// 建立连接按退避策略重试；连接建立后的读取错误由调用方处理。
    pub async fn subscribe(&self, cancel: &CancellationToken) -> SchedulerResult<SubscribeStream> {
        self.ensure_open()?;
        let mut stream =
            retry_with_backoff("subscribe", &self.backoff, cancel, || self.open_stream()).await?;
        stream.send(&StreamMessage::connect(&self.node_key)).await?;
        info!(node_key = %self.node_key, "Subscribed to master stream");
        Ok(stream)
    }

    async fn open_stream(&self) -> SchedulerResult<SubscribeStream> {
        self.ensure_open()?;
        let url = self.stream_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SchedulerError::Configuration(format!("invalid stream url {url}: {e}")))?;
        for (name, value) in self.headers.iter() {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        match connect_async(request).await {
            Ok((ws, _response)) => Ok(SubscribeStream::new(ws, self.node_key.clone())),
            Err(tokio_tungstenite::tungstenite::Error::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED =>
            {
                Err(SchedulerError::Unauthorized("stream handshake rejected".to_string()))
            }
            Err(e) => Err(SchedulerError::Connection(format!("open stream {url}: {e}"))),
        }
    }

    fn stream_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}{}", routes::SUBSCRIBE)
    }

    fn ensure_open(&self) -> SchedulerResult<()> {
        if self.is_closed() {
            return Err(SchedulerError::Connection("transport is closed".to_string()));
        }
        Ok(())
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> SchedulerResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.ensure_open()?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SchedulerError::Connection(format!("{url}: {e}")))?;
        Self::decode(response).await
    }

    /// 成功应答解码为 `Resp`，失败应答还原为类型化错误
    async fn decode<Resp: DeserializeOwned>(response: reqwest::Response) -> SchedulerResult<Resp> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| SchedulerError::Serialization(format!("invalid response body: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SchedulerError::Unauthorized(text));
        }
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(body.into_error()),
            Err(_) if status.is_server_error() => {
                warn!(%status, "Master returned an unstructured error");
                Err(SchedulerError::Internal(format!("HTTP {status}: {text}")))
            }
            Err(_) => Err(SchedulerError::Internal(format!("HTTP {status}: {text}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> TransportClient {
        let config = TransportConfig {
            master_url: url.to_string(),
            ..TransportConfig::default()
        };
        TransportClient::new(&config, "worker-1").unwrap()
    }

    #[test]
    fn test_stream_url_scheme() {
        assert_eq!(
            client("http://10.0.0.1:8900/").stream_url(),
            "ws://10.0.0.1:8900/rpc/nodes/subscribe"
        );
        assert_eq!(
            client("https://master.local").stream_url(),
            "wss://master.local/rpc/nodes/subscribe"
        );
    }

    #[test]
    fn test_state_machine() {
        let client = client("http://127.0.0.1:1");
        assert_eq!(client.state(), ClientState::Idle);
        assert!(!client.is_started());
        assert!(!client.is_closed());

        client.close();
        assert!(client.is_closed());
        assert!(!client.is_started());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = client("http://127.0.0.1:1");
        client.close();

        let cancel = CancellationToken::new();
        assert!(matches!(
            client.connect(&cancel).await,
            Err(SchedulerError::Connection(_))
        ));
        assert!(matches!(
            client.call_model(&ModelOperation::ListNodes).await,
            Err(SchedulerError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_honours_cancellation() {
        let client = client("http://127.0.0.1:1");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            client.connect(&cancel).await,
            Err(SchedulerError::Cancelled)
        ));
        assert!(!client.is_started());
    }
}
