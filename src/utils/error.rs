//! Helix 核心错误类型定义
//!
//! 本模块定义了核心各组件使用的所有错误类型。
//!
//! 错误的 Display 文本即控制协议对外暴露的内容（`ERR <op>: <原因>`），
//! 因此统一使用协议约定的英文措辞。

use thiserror::Error;

/// Helix 核心错误类型
#[derive(Error, Debug)]
pub enum HelixError {
    // ==================== 守护进程错误 ====================

    /// 守护进程尚未初始化
    #[error("Daemon not initialized")]
    NotInitialized,

    /// 模块未安装
    #[error("Not installed: {0}")]
    NotFound(String),

    /// 模块已存在（重复注册）
    #[error("Module '{0}' is already registered")]
    AlreadyPresent(String),

    /// 当前状态不允许该操作
    #[error("Module '{module}' is {state}; {operation} not allowed")]
    BadState {
        module: String,
        state: String,
        operation: String,
    },

    /// 卸载被依赖者阻止
    #[error("Cannot uninstall '{module}': required by {}", dependents.join(", "))]
    DependentsPresent {
        module: String,
        dependents: Vec<String>,
    },

    // ==================== 安装错误 ====================

    /// 清单解析或校验失败
    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),

    /// 包解压失败
    #[error("Extract failed: {0}")]
    ExtractFailed(String),

    /// 最低核心/API 版本门禁未满足
    #[error("{what} version {running} does not satisfy >={required}")]
    VersionGate {
        what: &'static str,
        running: String,
        required: String,
    },

    // ==================== 加载器错误 ====================

    /// 动态库打开失败
    #[error("Load failed: {reason}")]
    LoadFailed { module: String, reason: String },

    /// 入口符号解析失败
    #[error("Required entry point '{symbol}' not found in module '{module}'")]
    SymbolMissing { module: String, symbol: String },

    /// 模块生命周期函数返回非零
    #[error("Module '{module}' {entry} function failed with code: {code}")]
    ModuleCallFailed {
        module: String,
        entry: &'static str,
        code: i32,
    },

    // ==================== 依赖解析错误 ====================

    /// 必需依赖缺失
    #[error("Dependency resolution failed for '{module}'; missing: {}", missing.join(", "))]
    DependencyMissing {
        module: String,
        missing: Vec<String>,
    },

    /// 检测到循环依赖
    #[error("Dependency resolution failed for '{module}'; circular: {}", nodes.join(", "))]
    DependencyCircular { module: String, nodes: Vec<String> },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("Version parse error: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 核心操作结果类型别名
pub type Result<T> = std::result::Result<T, HelixError>;
