//! 控制 IPC 服务器
//!
//! 在文件系统本地的 Unix 流式 socket 上提供行协议控制接口。
//!
//! # 协议
//!
//! 每个客户端连接发送一条以换行结尾的命令，服务器写回一条
//! 以换行结尾的响应（可以多行）后关闭连接。命令严格按到达顺序
//! 逐条处理：accept → 读命令 → 执行 → 写响应构成一个完整周期，
//! 期间不接受新连接。注册表的所有变更都发生在这条控制路径上。
//!
//! # 监听端点
//!
//! - init 系统移交：`LISTEN_PID` 与本进程匹配且 `LISTEN_FDS` ≥ 1 时，
//!   直接使用继承的 fd 3，关闭时不删除 socket 文件
//! - 自建：确保父目录存在、清理陈旧 socket、绑定后把权限放宽到
//!   0666 以允许非 root 客户端，关闭时删除 socket 文件

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::daemon::HelixDaemon;
use crate::utils::{HelixError, Result};
use crate::{API_VERSION, CORE_VERSION};

/// init 系统 socket 移交的首个 fd
const SD_LISTEN_FDS_START: i32 = 3;

/// 控制 IPC 服务器
pub struct IpcServer {
    /// socket 路径
    socket_path: PathBuf,
    /// 守护进程引用
    daemon: Arc<HelixDaemon>,
    /// 运行标志
    running: AtomicBool,
    /// 关闭通知
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    /// 创建 IPC 服务器
    pub fn new(socket_path: impl Into<PathBuf>, daemon: Arc<HelixDaemon>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            socket_path: socket_path.into(),
            daemon,
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// 请求关闭服务循环
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// 运行服务循环直至 [`stop`](Self::stop) 被调用
    ///
    /// 单线程、一次一个连接；命令按到达顺序端到端处理。
    pub async fn serve(&self) -> Result<()> {
        let (listener, created_socket) = self.acquire_listener().await?;
        self.running.store(true, Ordering::SeqCst);

        info!(socket = %self.socket_path.display(), created = created_socket, "控制 IPC 服务器已启动");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            // 串行处理：响应写完前不 accept 下一个连接
                            if let Err(e) = self.handle_connection(stream).await {
                                warn!(error = %e, "处理控制连接失败");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "accept 失败");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        drop(listener);
        if created_socket && self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }

        info!("控制 IPC 服务器已停止");
        Ok(())
    }

    /// 获取监听 socket：优先使用 init 系统移交的 fd
    async fn acquire_listener(&self) -> Result<(UnixListener, bool)> {
        if Self::inherited_fd_count() > 0 {
            use std::os::unix::io::FromRawFd;

            // LISTEN_FDS 协议：首个移交 fd 固定为 3
            let std_listener =
                unsafe { std::os::unix::net::UnixListener::from_raw_fd(SD_LISTEN_FDS_START) };
            std_listener.set_nonblocking(true)?;
            let listener = UnixListener::from_std(std_listener)?;
            return Ok((listener, false));
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            HelixError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot bind '{}': {}", self.socket_path.display(), e),
            ))
        })?;

        // 默认允许非 root 客户端连接
        if let Err(e) =
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o666))
        {
            warn!(socket = %self.socket_path.display(), error = %e, "设置 socket 权限失败");
        }

        Ok((listener, true))
    }

    /// 读取 init 系统移交的 fd 数量（`LISTEN_PID` 必须指向本进程）
    fn inherited_fd_count() -> i32 {
        let pid = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|v| v.parse::<u32>().ok());
        let fds = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok());

        match (pid, fds) {
            (Some(pid), Some(fds)) if pid == std::process::id() => fds,
            _ => 0,
        }
    }

    /// 处理单个连接：读一条命令，写一条响应，关闭
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let command = line.trim();

        debug!(command = %command, "收到控制命令");

        let mut response = handle_command(&self.daemon, command).await;
        if !response.ends_with('\n') {
            response.push('\n');
        }

        writer.write_all(response.as_bytes()).await?;
        writer.shutdown().await?;
        Ok(())
    }
}

/// 执行一条控制命令并生成响应文本
///
/// 响应约定见命令表：成功为 `OK` 或查询结果，失败为
/// `ERR <op>: <原因>`；未知命令为 `ERR unknown command: <cmd>`。
pub async fn handle_command(daemon: &HelixDaemon, command: &str) -> String {
    if command == "status" {
        return daemon.status_text().await;
    }

    if command == "version" {
        return format!("core={}\napi={}\n", CORE_VERSION, API_VERSION);
    }

    if command == "list" {
        let modules = daemon.list_modules().await;
        if modules.is_empty() {
            // 空列表回一个换行表示成功
            return "\n".to_string();
        }
        let mut out = String::new();
        for (name, state) in modules {
            out.push_str(&format!("{} {}\n", name, state));
        }
        return out;
    }

    if let Some(name) = command.strip_prefix("info ") {
        return match daemon.module_info(name).await {
            None => "ERR not installed".to_string(),
            Some(info) => {
                let mut out = String::new();
                out.push_str(&format!("name={}\n", info.name));
                out.push_str(&format!("version={}\n", info.version));
                out.push_str(&format!("state={}\n", info.state));
                out.push_str(&format!("description={}\n", info.manifest.description));
                out.push_str(&format!("author={}\n", info.manifest.author));
                out.push_str(&format!("license={}\n", info.manifest.license));
                out.push_str(&format!("binary_path={}\n", info.manifest.binary_path));
                if !info.manifest.minimum_core_version.is_empty() {
                    out.push_str(&format!(
                        "minimum_core_version={}\n",
                        info.manifest.minimum_core_version
                    ));
                }
                if !info.manifest.minimum_api_version.is_empty() {
                    out.push_str(&format!(
                        "minimum_api_version={}\n",
                        info.manifest.minimum_api_version
                    ));
                }
                out
            }
        };
    }

    if let Some(path) = command.strip_prefix("install ") {
        return match daemon.install_module(std::path::Path::new(path)).await {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("ERR install: {}", e),
        };
    }

    if let Some(name) = command.strip_prefix("enable ") {
        return match daemon.enable_module(name).await {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("ERR enable: {}", e),
        };
    }

    if let Some(name) = command.strip_prefix("start ") {
        return match daemon.start_module(name).await {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("ERR start: {}", e),
        };
    }

    if let Some(name) = command.strip_prefix("stop ") {
        return match daemon.stop_module(name).await {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("ERR stop: {}", e),
        };
    }

    if let Some(name) = command.strip_prefix("disable ") {
        return match daemon.disable_module(name).await {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("ERR disable: {}", e),
        };
    }

    if let Some(name) = command.strip_prefix("uninstall ") {
        return match daemon.uninstall_module(name).await {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("ERR uninstall: {}", e),
        };
    }

    format!("ERR unknown command: {}", command)
}
