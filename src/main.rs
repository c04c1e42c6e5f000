//! Helix 守护进程命令行入口（helixd）
//!
//! # 命令概览
//!
//! - `start` - 启动守护进程（默认命令）
//! - `version` - 显示版本信息
//! - `check-config` - 验证配置文件
//!
//! # 使用示例
//!
//! ```bash
//! # 以默认配置启动
//! helixd
//!
//! # 指定模块目录与控制 socket
//! helixd --modules-dir /var/lib/helix/modules --socket /run/helixd/helixd.sock start
//!
//! # 检查配置文件
//! helixd -c helixd.yaml check-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use helix_core::core::config::{DaemonConfig, LogConfig};
use helix_core::{HelixDaemon, IpcServer};

/// Helix Daemon - 微内核扩展框架控制守护进程
#[derive(Parser)]
#[command(name = "helixd")]
#[command(version, about = "Helix 模块框架守护进程", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "helixd.yaml", global = true)]
    config: PathBuf,

    /// 模块根目录（覆盖配置文件）
    #[arg(long, global = true)]
    modules_dir: Option<PathBuf>,

    /// 控制 socket 路径（覆盖配置文件）
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 启动守护进程
    ///
    /// 初始化模块注册表并在控制 socket 上提供服务。
    /// 收到 SIGINT/SIGTERM 时优雅关闭。
    Start,

    /// 查看版本信息
    Version,

    /// 验证配置文件
    CheckConfig,
}

/// 初始化守护进程自身的 tracing 日志
///
/// 启用文件输出时返回写入器守卫，丢弃守卫会停掉后台写线程。
fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helix_core={0},helixd={0}", config.level)));

    if config.file_output {
        if let Some(ref log_dir) = config.log_dir {
            let appender = tracing_appender::rolling::daily(log_dir, "helixd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            return Some(guard);
        }
    }

    fmt().with_env_filter(filter).with_target(true).init();
    None
}

/// 加载配置并套用命令行覆盖项
async fn load_config(cli: &Cli) -> Result<DaemonConfig, Box<dyn std::error::Error>> {
    let mut config = if cli.config.exists() {
        DaemonConfig::from_file(&cli.config).await?
    } else {
        DaemonConfig::default()
    };

    if let Some(ref dir) = cli.modules_dir {
        config.modules_dir = dir.clone();
    }
    if let Some(ref socket) = cli.socket {
        config.socket_path = socket.clone();
    }
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }

    Ok(config)
}

/// 启动守护进程并阻塞到收到关闭信号
async fn run_start(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("启动 Helix 守护进程...");

    let daemon = Arc::new(HelixDaemon::new(&config.modules_dir));
    daemon.initialize().await?;

    println!("{}", daemon.status_text().await);
    println!("控制 socket: {}", config.socket_path.display());

    let server = Arc::new(IpcServer::new(&config.socket_path, daemon.clone()));
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!(error = %e, "控制 IPC 服务器退出");
            }
        })
    };

    // 等待关闭信号
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("收到 SIGINT，正在关闭...");
        }
        _ = sigterm.recv() => {
            info!("收到 SIGTERM，正在关闭...");
        }
    }

    server.stop();
    let _ = server_task.await;
    daemon.shutdown().await;

    info!("Helix 守护进程已关闭");
    Ok(())
}

/// 打印版本信息
fn print_version() {
    println!("Helix Daemon (helixd)");
    println!("  core:    {}", helix_core::CORE_VERSION);
    println!("  api:     {}", helix_core::API_VERSION);
    println!("  target:  {} / {}", std::env::consts::ARCH, std::env::consts::OS);
}

/// 检查配置文件
async fn check_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        println!("配置文件不存在（{}），将使用默认配置", path.display());
        let config = DaemonConfig::default();
        println!("  模块目录:     {}", config.modules_dir.display());
        println!("  控制 socket:  {}", config.socket_path.display());
        return Ok(());
    }

    match DaemonConfig::from_file(path).await {
        Ok(config) => {
            println!("配置文件有效: {}", path.display());
            println!("  模块目录:     {}", config.modules_dir.display());
            println!("  控制 socket:  {}", config.socket_path.display());
            println!("  日志级别:     {}", config.logging.level);
            Ok(())
        }
        Err(e) => {
            println!("配置文件无效: {}", e);
            Err(Box::new(e))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            print_version();
            return Ok(());
        }
        Some(Commands::CheckConfig) => {
            return check_config(&cli.config).await;
        }
        Some(Commands::Start) | None => {}
    }

    let config = load_config(&cli).await?;
    let _log_guard = init_logging(&config.logging);

    run_start(config).await
}
