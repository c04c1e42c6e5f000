//! 对外接口
//!
//! - [`daemon`] - 守护进程核心（注册表 + 状态机）
//! - [`ipc`] - 行协议控制服务器

pub mod daemon;
pub mod ipc;

pub use daemon::{HelixDaemon, RegistryEntry};
pub use ipc::IpcServer;
