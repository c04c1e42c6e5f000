//! 模块清单数据模型
//!
//! 定义 `.helx` 包中 `manifest.json` 对应的所有数据结构，
//! 以及注册表使用的模块状态机状态。
//!
//! # 主要类型
//!
//! - [`ModuleManifest`] - 模块的权威元数据
//! - [`Dependency`] - 依赖声明（名称 + 版本要求 + 可选标记）
//! - [`EntryPoints`] - 四个生命周期入口符号名（带默认值）
//! - [`ModuleState`] - 注册表状态机状态

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 默认 init 入口符号
fn default_init_symbol() -> String {
    "helix_module_init".to_string()
}

/// 默认 start 入口符号
fn default_start_symbol() -> String {
    "helix_module_start".to_string()
}

/// 默认 stop 入口符号
fn default_stop_symbol() -> String {
    "helix_module_stop".to_string()
}

/// 默认 destroy 入口符号
fn default_destroy_symbol() -> String {
    "helix_module_destroy".to_string()
}

/// 生命周期入口符号配置
///
/// 每个字段都是动态库中的 C 符号名。清单未提供时使用
/// `helix_module_*` 默认名。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoints {
    /// init 入口符号（`int (*)(void)`）
    #[serde(default = "default_init_symbol")]
    pub init: String,

    /// start 入口符号（`int (*)(void)`）
    #[serde(default = "default_start_symbol")]
    pub start: String,

    /// stop 入口符号（`int (*)(void)`）
    #[serde(default = "default_stop_symbol")]
    pub stop: String,

    /// destroy 入口符号（`void (*)(void)`）
    #[serde(default = "default_destroy_symbol")]
    pub destroy: String,
}

impl Default for EntryPoints {
    fn default() -> Self {
        Self {
            init: default_init_symbol(),
            start: default_start_symbol(),
            stop: default_stop_symbol(),
            destroy: default_destroy_symbol(),
        }
    }
}

/// 依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// 被依赖模块的名称
    pub name: String,

    /// 版本要求：空、裸版本号，或 `>= <= > < == ~` 之一加版本号
    #[serde(default)]
    pub version: String,

    /// 是否为可选依赖
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    /// 创建必需依赖
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            optional: false,
        }
    }

    /// 标记为可选依赖
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// 模块清单
///
/// `.helx` 包内 `manifest.json` 的权威表示。未知字段在解析时被忽略。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// 模块唯一名称（`[A-Za-z][A-Za-z0-9_-]{0,63}`）
    pub name: String,

    /// 模块版本（semver `MAJOR.MINOR.PATCH`，可带 `+`/`-` 后缀）
    pub version: String,

    /// 安装目录内动态库的相对路径
    pub binary_path: String,

    /// 人类可读描述
    #[serde(default)]
    pub description: String,

    /// 作者
    #[serde(default)]
    pub author: String,

    /// 许可证
    #[serde(default)]
    pub license: String,

    /// 主页 URL
    #[serde(default)]
    pub homepage: String,

    /// 源码仓库 URL
    #[serde(default)]
    pub repository: String,

    /// 安装时要求的最低核心版本（空表示不限制）
    #[serde(default)]
    pub minimum_core_version: String,

    /// 安装时要求的最低 API 版本（空表示不限制）
    #[serde(default)]
    pub minimum_api_version: String,

    /// 依赖声明列表（有序）
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// 能力声明（核心不解释其语义）
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// 标签（核心不解释其语义）
    #[serde(default)]
    pub tags: Vec<String>,

    /// 模块私有配置（对核心是不透明的透传数据）
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// 生命周期入口符号
    #[serde(default)]
    pub entry_points: EntryPoints,
}

impl ModuleManifest {
    /// 创建只含必填字段的清单（测试与工具用）
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        binary_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            binary_path: binary_path.into(),
            ..Default::default()
        }
    }
}

/// 模块状态机状态
///
/// 状态名的文本形式（`Display`/`FromStr`、serde 序列化）被持久化
/// 边车文件与控制协议共同使用，不可改动。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    /// 未知（仅在异常路径出现）
    Unknown,
    /// 已安装（未加载）
    Installed,
    /// 动态库已打开，尚未初始化
    Loaded,
    /// init 已成功
    Initialized,
    /// start 已成功且未 stop
    Running,
    /// stop 已成功
    Stopped,
    /// 操作失败后的终态（可通过 disable 恢复）
    Error,
}

impl ModuleState {
    /// 状态是否意味着加载器持有存活的库句柄
    pub fn is_loaded(&self) -> bool {
        matches!(
            self,
            ModuleState::Loaded
                | ModuleState::Initialized
                | ModuleState::Running
                | ModuleState::Stopped
        )
    }

    /// 是否允许 start
    pub fn can_start(&self) -> bool {
        matches!(self, ModuleState::Initialized | ModuleState::Stopped)
    }

    /// 是否允许 stop
    pub fn can_stop(&self) -> bool {
        matches!(self, ModuleState::Running)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Unknown => "Unknown",
            ModuleState::Installed => "Installed",
            ModuleState::Loaded => "Loaded",
            ModuleState::Initialized => "Initialized",
            ModuleState::Running => "Running",
            ModuleState::Stopped => "Stopped",
            ModuleState::Error => "Error",
        };
        f.write_str(s)
    }
}

impl FromStr for ModuleState {
    type Err = ();

    /// 未识别的状态名归一化为 `Unknown`（恢复路径要求宽容）
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "Installed" => ModuleState::Installed,
            "Loaded" => ModuleState::Loaded,
            "Initialized" => ModuleState::Initialized,
            "Running" => ModuleState::Running,
            "Stopped" => ModuleState::Stopped,
            "Error" => ModuleState::Error,
            _ => ModuleState::Unknown,
        })
    }
}
