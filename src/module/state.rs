//! 模块状态持久化
//!
//! 守护进程关闭时把各模块的高层状态写入模块根目录下的
//! `.helix_state.json` 边车文件，启动时读回用于恢复。
//!
//! 读取端是宽容的：文件缺失或为空视为「无可恢复状态」，内容损坏
//! 记日志后跳过恢复，二者都不是错误。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::module::manifest::ModuleState;
use crate::utils::Result;

/// 边车文件名
pub const STATE_FILE_NAME: &str = ".helix_state.json";

/// 边车文件顶层结构
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    modules: HashMap<String, PersistedModule>,
}

/// 单个模块的持久化条目
#[derive(Debug, Serialize, Deserialize)]
struct PersistedModule {
    state: String,
}

/// 边车文件的完整路径
pub fn state_file_path(modules_root: &Path) -> PathBuf {
    modules_root.join(STATE_FILE_NAME)
}

/// 写入模块状态边车文件
///
/// 全部模块都会写入；无法恢复的状态在读取时归一化。
pub async fn save_states(
    modules_root: &Path,
    states: &HashMap<String, ModuleState>,
) -> Result<()> {
    let persisted = PersistedState {
        modules: states
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    PersistedModule {
                        state: state.to_string(),
                    },
                )
            })
            .collect(),
    };

    let content = serde_json::to_string_pretty(&persisted)?;
    let path = state_file_path(modules_root);
    tokio::fs::write(&path, content).await?;

    debug!(path = %path.display(), count = states.len(), "模块状态已保存");
    Ok(())
}

/// 读取模块状态边车文件
///
/// 只保留可恢复的目标状态：`Installed`、`Initialized`、`Running`、
/// `Stopped`；`Error`/`Loaded`/`Unknown` 归一化为 `Installed`。
///
/// # Returns
///
/// 文件缺失/为空/损坏时返回空映射（记录日志，不报错）。
pub async fn load_states(modules_root: &Path) -> HashMap<String, ModuleState> {
    let path = state_file_path(modules_root);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(_) => {
            debug!(path = %path.display(), "无已保存的模块状态");
            return HashMap::new();
        }
    };

    if content.trim().is_empty() {
        return HashMap::new();
    }

    let persisted: PersistedState = match serde_json::from_str(&content) {
        Ok(persisted) => persisted,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "状态文件损坏，跳过恢复");
            return HashMap::new();
        }
    };

    persisted
        .modules
        .into_iter()
        .map(|(name, entry)| {
            let state: ModuleState = entry.state.parse().unwrap_or(ModuleState::Unknown);
            (name, normalize(state))
        })
        .collect()
}

/// 把不可恢复的状态归一化为 `Installed`
fn normalize(state: ModuleState) -> ModuleState {
    match state {
        ModuleState::Installed
        | ModuleState::Initialized
        | ModuleState::Running
        | ModuleState::Stopped => state,
        ModuleState::Error | ModuleState::Loaded | ModuleState::Unknown => ModuleState::Installed,
    }
}
