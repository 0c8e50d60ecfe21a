//! master的RPC服务
//!
//! 请求应答类调用为JSON POST，消息流为WebSocket：
//!
//! | 路径 | 方法 | 说明 |
//! |------|------|------|
//! | `/rpc/ping` | GET | 连通性探测 |
//! | `/rpc/nodes/register` | POST | 节点注册 |
//! | `/rpc/nodes/heartbeat` | POST | 节点心跳 |
//! | `/rpc/nodes/unsubscribe` | POST | 取消订阅 |
//! | `/rpc/model` | POST | 记录操作委托 |
//! | `/rpc/nodes/subscribe` | GET | 消息流（WebSocket） |
//!
//! 所有路径都要求 `Authorization: Bearer <auth_key>`。

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crawlhub_core::{
    models::{Ack, ModelOperation, NodeIdentity, StreamMessage, StreamMessageCode},
    traits::Repositories,
    ErrorBody, SchedulerError,
};
use crawlhub_infrastructure::transport::routes;

use crate::node_service::{NodeService, Subscription};

/// RPC服务共享状态
#[derive(Clone)]
pub struct RpcState {
    pub node_service: Arc<NodeService>,
    pub repos: Repositories,
    pub auth_key: Arc<str>,
    /// 每个消息流的待发送消息缓冲
    pub message_buffer: usize,
}

impl RpcState {
    pub fn new(node_service: Arc<NodeService>, repos: Repositories, auth_key: &str) -> Self {
        Self {
            node_service,
            repos,
            auth_key: Arc::from(auth_key),
            message_buffer: 64,
        }
    }
}

/// `SchedulerError` 到HTTP应答的映射
#[derive(Debug)]
pub struct RpcError(pub SchedulerError);

impl From<SchedulerError> for RpcError {
    fn from(err: SchedulerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SchedulerError::Forbidden(_) => StatusCode::FORBIDDEN,
            SchedulerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SchedulerError::InvalidTaskState { .. } => StatusCode::CONFLICT,
            err if err.is_not_found() => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("RPC处理失败: {}", self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

/// 创建RPC路由
pub fn rpc_router(state: RpcState) -> Router {
    Router::new()
        .route(routes::PING, get(ping))
        .route(routes::REGISTER, post(register))
        .route(routes::HEARTBEAT, post(heartbeat))
        .route(routes::UNSUBSCRIBE, post(unsubscribe))
        .route(routes::MODEL, post(model))
        .route(routes::SUBSCRIBE, get(subscribe))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 在监听器上运行路由，直到取消
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("RPC服务监听 {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn auth_middleware(State(state): State<RpcState>, req: Request, next: Next) -> Response {
    let expected = format!("Bearer {}", state.auth_key);
    let provided = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if provided != Some(expected.as_str()) {
        warn!("拒绝未认证的请求: {}", req.uri().path());
        return RpcError(SchedulerError::Unauthorized("invalid auth key".to_string())).into_response();
    }
    next.run(req).await
}

async fn ping() -> Json<Ack> {
    Json(Ack::ok())
}

async fn register(
    State(state): State<RpcState>,
    Json(identity): Json<NodeIdentity>,
) -> Result<Json<Ack>, RpcError> {
    state.node_service.register(&identity).await?;
    Ok(Json(Ack::ok()))
}

async fn heartbeat(
    State(state): State<RpcState>,
    Json(identity): Json<NodeIdentity>,
) -> Result<Json<Ack>, RpcError> {
    state.node_service.heartbeat(&identity).await?;
    Ok(Json(Ack::ok()))
}

async fn unsubscribe(
    State(state): State<RpcState>,
    Json(identity): Json<NodeIdentity>,
) -> Result<Json<Ack>, RpcError> {
    state.node_service.unsubscribe(&identity).await?;
    Ok(Json(Ack::ok()))
}

async fn model(
    State(state): State<RpcState>,
    Json(op): Json<ModelOperation>,
) -> Result<Json<Value>, RpcError> {
    debug!("执行记录操作: {}", op.name());
    let value = op.apply(&state.repos).await?;
    Ok(Json(value))
}

async fn subscribe(State(state): State<RpcState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_stream(state, socket))
}

async fn handle_stream(state: RpcState, mut socket: WebSocket) {
    let Some(node_key) = wait_for_connect(&mut socket).await else {
        debug!("消息流在CONNECT之前关闭");
        return;
    };

    let (subscription, mut outbound) = Subscription::new(state.message_buffer);
    let subscription_id = subscription.id();
    let finished = subscription.finished().clone();
    state.node_service.set_subscribe(&node_key, subscription).await;
    info!("节点 {} 已订阅消息流", node_key);

    // 订阅被替换后发送端随旧订阅一起释放，此后只继续读取直到对端关闭
    let mut outbound_open = true;

    loop {
        tokio::select! {
            _ = finished.cancelled() => {
                debug!("节点 {} 的消息流被结束", node_key);
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = outbound.recv(), if outbound_open => {
                let Some(msg) = msg else {
                    outbound_open = false;
                    continue;
                };
                if let Err(e) = send_envelope(&mut socket, &msg).await {
                    warn!("向节点 {} 推送消息失败: {}", node_key, e);
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_inbound(&node_key, text.as_str(), &mut socket).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("节点 {} 的消息流读取失败: {}", node_key, e);
                        break;
                    }
                }
            }
        }
    }

    if state
        .node_service
        .delete_subscribe_if(&node_key, subscription_id)
        .await
    {
        info!("节点 {} 的消息流已断开", node_key);
    }
}

/// 处理节点发来的消息，返回是否继续
async fn handle_inbound(node_key: &str, text: &str, socket: &mut WebSocket) -> bool {
    let msg = match StreamMessage::deserialize(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("节点 {} 发送了无法解析的消息: {}", node_key, e);
            return true;
        }
    };

    match msg.code {
        StreamMessageCode::Ping => send_envelope(socket, &StreamMessage::ping(node_key))
            .await
            .is_ok(),
        StreamMessageCode::SendEvent => {
            info!("节点 {} 事件: {}", node_key, msg.data);
            true
        }
        StreamMessageCode::Disconnect => {
            debug!("节点 {} 主动断开消息流", node_key);
            false
        }
        code => {
            debug!("忽略节点 {} 发来的 {:?} 消息", node_key, code);
            true
        }
    }
}

async fn wait_for_connect(socket: &mut WebSocket) -> Option<String> {
    while let Some(incoming) = socket.recv().await {
        let Message::Text(text) = incoming.ok()? else {
            continue;
        };
        match StreamMessage::deserialize(text.as_str()) {
            Ok(msg) if msg.code == StreamMessageCode::Connect => return Some(msg.node_key),
            Ok(msg) => warn!("消息流首条消息应为CONNECT，收到 {:?}", msg.code),
            Err(e) => warn!("无法解析的消息流消息: {}", e),
        }
    }
    None
}

async fn send_envelope(socket: &mut WebSocket, msg: &StreamMessage) -> Result<(), SchedulerError> {
    let json = msg.serialize()?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SchedulerError::Stream(e.to_string()))
}
