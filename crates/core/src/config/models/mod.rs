pub mod app_config;
pub mod dispatcher_worker;
pub mod message_queue;
pub mod node_transport;
pub mod observability;

pub use app_config::AppConfig;
pub use dispatcher_worker::{MasterConfig, WorkerConfig};
pub use message_queue::{QueueBackend, QueueConfig};
pub use node_transport::{BackoffConfig, NodeConfig, TransportConfig};
pub use observability::ObservabilityConfig;
