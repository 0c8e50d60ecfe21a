//! master与worker之间的传输层
//!
//! 请求/应答类调用使用HTTP POST，master推送使用WebSocket。
//! 每个请求都带有 `Authorization: Bearer <auth_key>` 和 `X-Node-Key` 两个头，
//! master侧中间件据此校验。

pub mod backoff;
pub mod client;
pub mod stream;

pub use backoff::{is_retryable, retry_with_backoff, ExponentialBackoff};
pub use client::{ClientState, TransportClient};
pub use stream::SubscribeStream;

/// 节点标识请求头
pub const NODE_KEY_HEADER: &str = "x-node-key";

/// RPC路由
pub mod routes {
    pub const PING: &str = "/rpc/ping";
    pub const REGISTER: &str = "/rpc/nodes/register";
    pub const HEARTBEAT: &str = "/rpc/nodes/heartbeat";
    pub const UNSUBSCRIBE: &str = "/rpc/nodes/unsubscribe";
    pub const SUBSCRIBE: &str = "/rpc/nodes/subscribe";
    pub const MODEL: &str = "/rpc/model";
}
