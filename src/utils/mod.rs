//! 工具模块
//!
//! 包含错误类型与模块日志注册中心。

pub mod error;
pub mod logging;

// 重导出常用类型
pub use error::{HelixError, Result};
pub use logging::{registry as log_registry, LogRegistry, LogStats};
