//! # 数据模型
//!
//! 协调核心读写的全部记录和消息：
//!
//! - [`Node`] - 集群节点，注册时创建，由心跳和Runner容量上报按字段更新
//! - [`Task`] - 任务，`Pending → Running → {Finished | Error | Cancelled}`
//! - [`Spider`] - 爬虫定义，提供命令和需要同步的源文件
//! - [`TaskMessage`] - 队列中的任务消息，入队到取出之间存在，只被消费一次
//! - [`StreamMessage`] - master与worker之间消息流的信封
//! - [`ModelOperation`] - worker通过RPC委托master执行的记录操作
//!
//! 所有时间字段使用 `DateTime<Utc>`，所有模型都实现 serde 序列化，
//! 既用于内存存储也用于网络传输。

pub mod message;
pub mod node;
pub mod operation;
pub mod spider;
pub mod task;

pub use message::*;
pub use node::*;
pub use operation::*;
pub use spider::*;
pub use task::*;
