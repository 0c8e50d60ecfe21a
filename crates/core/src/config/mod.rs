//! 配置管理
//!
//! [`AppConfig`] 由内置默认值、TOML配置文件和 `CRAWLHUB_` 前缀的环境变量三层合并而成，
//! 加载后按分节校验。命令行参数在二进制入口处再覆盖一次。

pub mod models;

pub use models::*;
