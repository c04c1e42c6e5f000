//! # Helix Core - 微内核扩展框架
//!
//! Helix 是面向 Linux 的用户态微内核式扩展框架。常驻的控制守护进程
//! 负责安装、启用、启动、停止、禁用与卸载**模块**：打包在自描述
//! `.helx` 归档（清单 + 位置无关动态库）中的原生扩展。核心提供：
//!
//! - **模块注册表与生命周期状态机**: 每个已安装模块及其状态转换的事实源
//! - **动态加载器**: 打开动态库、按符号名解析四个生命周期入口并驱动调用
//! - **依赖解析器**: 版本感知的依赖图、环与缺失检测、依赖优先的加载顺序
//! - **安装管线**: `.helx`（gzip tar）安全解压、版本门禁与登记
//! - **状态持久化**: 跨守护进程重启保存/恢复模块状态
//! - **日志注册中心**: 进程级多接收器有界队列日志分发
//! - **控制 IPC**: Unix socket 上的单线程行协议控制服务器
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use helix_core::{HelixDaemon, IpcServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let daemon = Arc::new(HelixDaemon::new("./modules"));
//!     daemon.initialize().await?;
//!
//!     let server = IpcServer::new("/tmp/helixd.sock", daemon.clone());
//!     server.serve().await?;
//!
//!     daemon.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 清单、依赖解析、加载器、解压与持久化
//! - `api` - 守护进程核心与控制 IPC
//! - `core` - 配置
//! - `utils` - 错误类型与日志注册中心

#![warn(missing_docs)]

pub mod api;
pub mod core;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{HelixDaemon, IpcServer, RegistryEntry};
pub use crate::core::config::{DaemonConfig, DaemonConfigBuilder};
pub use module::{
    Dependency, DependencyResolver, EntryPoints, ManifestParser, ModuleLoader, ModuleManifest,
    ModuleState, ResolutionResult,
};
pub use utils::{HelixError, Result};

/// 核心版本（安装门禁 `minimum_core_version` 的比较对象）
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 模块 API 版本（安装门禁 `minimum_api_version` 的比较对象）
pub const API_VERSION: &str = "1.0.0";
