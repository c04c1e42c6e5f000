//! 核心配置

pub mod config;

pub use config::{DaemonConfig, DaemonConfigBuilder, LogConfig};
