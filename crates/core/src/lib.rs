//! crawlhub 协调核心：错误类型、数据模型、协作接口、配置和日志初始化

pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::*;
pub use logging::init_logging;

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
