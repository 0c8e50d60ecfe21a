pub mod log_sink;
pub mod memory_store;
pub mod observability;
pub mod process;
pub mod queue;
pub mod remote_repository;
pub mod transport;

pub use log_sink::{FileLogSink, FileLogSinkFactory};
pub use memory_store::MemoryStore;
pub use process::SystemProcessBuilder;
pub use queue::{InMemoryTaskQueue, RedisTaskQueue, TaskQueue};
pub use remote_repository::RemoteRepository;
pub use transport::{SubscribeStream, TransportClient};
