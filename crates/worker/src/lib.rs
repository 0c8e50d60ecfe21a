//! crawlhub worker节点
//!
//! - [`node_client`]: 向master注册、发送心跳并接收消息流
//! - [`runner`]: 单个任务的进程执行与状态机
//! - [`runner_service`]: 本节点的Runner池与容量上报
//! - [`service`]: 组合以上组件的节点服务

pub mod file_sync;
pub mod node_client;
pub mod runner;
pub mod runner_service;
pub mod service;

pub use node_client::NodeClient;
pub use runner::{RunnerConfig, RunnerContext, RunnerSignal, TaskRunner};
pub use runner_service::RunnerService;
pub use service::{WorkerService, WorkerServiceBuilder};
