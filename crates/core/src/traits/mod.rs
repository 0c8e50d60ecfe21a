pub mod log_sink;
pub mod process;
pub mod repository;

pub use log_sink::*;
pub use process::*;
pub use repository::*;
