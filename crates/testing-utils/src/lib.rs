//! # Crawlhub Testing Utils
//!
//! 各crate测试共用的构建器、内存替身和容器工具。
//!
//! ```toml
//! [dev-dependencies]
//! crawlhub-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;
