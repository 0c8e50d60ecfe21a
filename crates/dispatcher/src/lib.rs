//! crawlhub master侧协调组件
//!
//! - [`node_service`]: 节点注册、心跳与消息流订阅表
//! - [`monitor`]: 根据心跳维护节点在线状态
//! - [`scheduler`]: 任务入队、分配与取消
//! - [`strategies`]: 按运行模式选择目标节点
//! - [`server`]: RPC服务

pub mod monitor;
pub mod node_service;
pub mod scheduler;
pub mod server;
pub mod strategies;

pub use monitor::{NodeMonitor, NodeMonitorConfig};
pub use node_service::{NodeService, Subscription};
pub use scheduler::TaskScheduler;
pub use server::{rpc_router, serve, RpcState};
pub use strategies::NodeSelector;
