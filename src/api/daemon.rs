//! Helix 守护进程核心
//!
//! 本模块是整个系统的事实源：持有 `模块名 -> RegistryEntry` 注册表，
//! 驱动生命周期状态机，并在安装/启用/卸载等操作中协调解压器、
//! 清单解析器、依赖解析器与动态加载器。
//!
//! # 状态机
//!
//! ```text
//! Installed → enable → Loaded → (init) → Initialized → start → Running
//!     ↑                                        ↑                  │
//!     └────────────── disable ────────────────┘         stop → Stopped → start
//! ```
//!
//! 失败不前进：加载/初始化失败回到 `Installed`，stop/unload 失败
//! 进入 `Error`。所有变更都在控制线程上串行执行，注册表本身
//! 不需要额外的并发保护，锁只是共享所有权的载体。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::module::archive;
use crate::module::dependency::DependencyResolver;
use crate::module::loader::ModuleLoader;
use crate::module::manifest::{ModuleManifest, ModuleState};
use crate::module::parser::ManifestParser;
use crate::module::state as persistence;
use crate::utils::{HelixError, Result};
use crate::{API_VERSION, CORE_VERSION};

/// 包扩展名
const PACKAGE_EXTENSION: &str = "helx";

/// 安装标记文件名：目录扫描据此区分核心安装的模块目录与杂散目录
const INSTALL_MARKER: &str = ".helx_installed";

/// 清单文件名
const MANIFEST_FILE: &str = "manifest.json";

/// 注册表条目：一个已知模块的全部运行时信息
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// 模块名（与注册表键一致）
    pub name: String,
    /// 模块版本
    pub version: String,
    /// 安装目录（模块根目录下的绝对路径）
    pub install_path: PathBuf,
    /// 清单快照
    pub manifest: ModuleManifest,
    /// 当前状态
    pub state: ModuleState,
    /// 最近一次操作失败的错误信息
    pub last_error: Option<String>,
    /// 加载时间
    pub loaded_at: Option<DateTime<Utc>>,
    /// 启动时间
    pub started_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    fn new(manifest: ModuleManifest, install_path: PathBuf) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            install_path,
            manifest,
            state: ModuleState::Installed,
            last_error: None,
            loaded_at: None,
            started_at: None,
        }
    }
}

/// Helix 守护进程
///
/// 注册表、依赖解析器与加载器的唯一属主。所有操作经由控制线程
/// 串行进入（见 IPC 服务器），方法本身都是 `&self`。
pub struct HelixDaemon {
    /// 模块根目录
    modules_dir: PathBuf,
    /// 注册表：name -> entry
    registry: RwLock<HashMap<String, RegistryEntry>>,
    /// 依赖解析器
    resolver: RwLock<DependencyResolver>,
    /// 动态加载器
    loader: RwLock<ModuleLoader>,
    /// 是否已初始化
    initialized: AtomicBool,
}

impl HelixDaemon {
    /// 创建守护进程实例（尚未初始化）
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            registry: RwLock::new(HashMap::new()),
            resolver: RwLock::new(DependencyResolver::new()),
            loader: RwLock::new(ModuleLoader::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// 模块根目录
    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    /// 是否已初始化
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(HelixError::NotInitialized)
        }
    }

    // ==================== 启动与恢复 ====================

    /// 初始化守护进程
    ///
    /// 创建模块根目录、扫描已安装模块、尽力恢复上次保存的状态。
    /// 恢复过程中的失败只记日志，绝不致命。
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("daemon is already initialized").into());
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.modules_dir).await {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        self.scan_modules_directory().await;

        let saved = persistence::load_states(&self.modules_dir).await;
        if saved.is_empty() {
            debug!("无可恢复的模块状态");
        } else {
            info!(count = saved.len(), "开始恢复上次的模块状态");
            self.restore_saved_states(saved).await;
        }

        info!(dir = %self.modules_dir.display(), "Helix 守护进程初始化完成");
        Ok(())
    }

    /// 扫描模块根目录，登记带安装标记的模块目录
    ///
    /// 幂等：已登记且路径一致的模块不受影响；清单缺失、解析失败
    /// 或与现有条目路径冲突的目录记警告后忽略。
    async fn scan_modules_directory(&self) {
        let mut dir = match tokio::fs::read_dir(&self.modules_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(dir = %self.modules_dir.display(), error = %e, "无法读取模块根目录");
                return;
            }
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if !path.join(INSTALL_MARKER).exists() {
                continue;
            }

            let manifest = match ManifestParser::parse_file(&path.join(MANIFEST_FILE)).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "模块目录清单无效，忽略");
                    continue;
                }
            };

            {
                let registry = self.registry.read().await;
                if let Some(existing) = registry.get(&manifest.name) {
                    if existing.install_path != path {
                        warn!(
                            module = %manifest.name,
                            dir = %path.display(),
                            existing = %existing.install_path.display(),
                            "目录与已登记模块冲突，忽略"
                        );
                    }
                    continue;
                }
            }

            let name = manifest.name.clone();
            {
                let mut resolver = self.resolver.write().await;
                if let Err(e) = resolver.add(manifest.clone()) {
                    warn!(module = %name, error = %e, "注册到依赖解析器失败");
                    continue;
                }
            }
            self.registry
                .write()
                .await
                .insert(name.clone(), RegistryEntry::new(manifest, path));

            info!(module = %name, "扫描登记模块");
        }
    }

    /// 按保存的状态恢复模块
    ///
    /// 两趟：先按依赖顺序启用目标至少为 `Initialized` 的模块，
    /// 再按依赖顺序启动目标为 `Running` 的模块。解析失败时退化为
    /// 输入顺序；单个模块失败记日志后继续。
    async fn restore_saved_states(&self, saved: HashMap<String, ModuleState>) {
        let mut to_enable: Vec<String> = Vec::new();
        for (name, desired) in &saved {
            match desired {
                ModuleState::Initialized | ModuleState::Running | ModuleState::Stopped => {
                    if self.registry.read().await.contains_key(name) {
                        to_enable.push(name.clone());
                    } else {
                        info!(module = %name, "跳过恢复：未安装");
                    }
                }
                _ => {}
            }
        }

        if !to_enable.is_empty() {
            let result = self.resolver.read().await.resolve(&to_enable);
            if !result.success {
                warn!("恢复：依赖解析存在问题，退化为简单顺序");
            }
            let order = if result.load_order.is_empty() {
                to_enable.clone()
            } else {
                result.load_order
            };

            for name in &order {
                let state = self.module_state(name).await;
                if state == Some(ModuleState::Installed) {
                    if let Err(e) = self.enable_module(name).await {
                        error!(module = %name, error = %e, "恢复：启用失败");
                    }
                }
            }
        }

        let to_start: Vec<String> = {
            let registry = self.registry.read().await;
            saved
                .iter()
                .filter(|(name, desired)| {
                    **desired == ModuleState::Running && registry.contains_key(*name)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        if !to_start.is_empty() {
            let result = self.resolver.read().await.resolve(&to_start);
            let order = if result.load_order.is_empty() {
                to_start
            } else {
                result.load_order
            };

            for name in &order {
                let state = self.module_state(name).await;
                if matches!(state, Some(s) if s.can_start()) {
                    if let Err(e) = self.start_module(name).await {
                        error!(module = %name, error = %e, "恢复：启动失败");
                    }
                }
            }
        }
    }

    /// 关闭守护进程
    ///
    /// 先尽力保存状态边车，然后停止所有运行中的模块、禁用所有已启用
    /// 模块，最后清空注册表与解析器。不删除任何模块文件。
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("正在关闭 Helix 守护进程...");

        let states: HashMap<String, ModuleState> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .map(|(name, entry)| (name.clone(), entry.state))
                .collect()
        };
        if let Err(e) = persistence::save_states(&self.modules_dir, &states).await {
            error!(error = %e, "保存模块状态失败");
        }

        // 已关闭标记置位后内部操作绕过 ensure_initialized
        let mut names: Vec<String> = states.keys().cloned().collect();
        names.sort();

        for name in &names {
            if self.module_state(name).await == Some(ModuleState::Running) {
                info!(module = %name, "关闭：停止模块");
                if let Err(e) = self.stop_module_inner(name).await {
                    error!(module = %name, error = %e, "关闭：停止失败");
                }
            }
        }

        for name in &names {
            if matches!(
                self.module_state(name).await,
                Some(ModuleState::Initialized) | Some(ModuleState::Stopped)
            ) {
                info!(module = %name, "关闭：禁用模块");
                if let Err(e) = self.disable_module_inner(name).await {
                    error!(module = %name, error = %e, "关闭：禁用失败");
                }
            }
        }

        // 兜底卸载任何残留句柄（例如 Error 状态的模块）
        {
            let mut loader = self.loader.write().await;
            for name in loader.loaded_modules() {
                if let Err(e) = loader.unload(&name) {
                    error!(module = %name, error = %e, "关闭：卸载残留句柄失败");
                }
            }
        }

        self.registry.write().await.clear();
        self.resolver.write().await.clear();

        info!("Helix 守护进程已关闭");
    }

    // ==================== 安装与卸载 ====================

    /// 从 `.helx` 包安装模块
    ///
    /// 解压到临时目录 → 解析清单 → 版本门禁 → 移入
    /// `<modules_root>/<name>/` → 写安装标记 → 登记。任一步失败时
    /// 清理临时目录，注册表保持不变。
    pub async fn install_module(&self, package_path: &Path) -> Result<()> {
        self.ensure_initialized()?;

        let is_helx = package_path
            .extension()
            .map(|ext| ext == PACKAGE_EXTENSION)
            .unwrap_or(false);
        if !is_helx || !package_path.is_file() {
            return Err(HelixError::ExtractFailed(
                "unsupported package type (expected .helx)".to_string(),
            ));
        }

        info!(package = %package_path.display(), "开始安装模块");

        let temp_dir = archive::extract_package(package_path, &self.modules_dir)?;

        match self.install_extracted(&temp_dir).await {
            Ok(name) => {
                if temp_dir.exists() {
                    let _ = tokio::fs::remove_dir_all(&temp_dir).await;
                }
                info!(module = %name, "模块安装成功");
                Ok(())
            }
            Err(e) => {
                if temp_dir.exists() {
                    let _ = tokio::fs::remove_dir_all(&temp_dir).await;
                }
                Err(e)
            }
        }
    }

    /// 安装流程的后半段：清单解析、门禁、落盘与登记
    async fn install_extracted(&self, temp_dir: &Path) -> Result<String> {
        let manifest = ManifestParser::parse_file(&temp_dir.join(MANIFEST_FILE)).await?;

        // 版本门禁
        if !manifest.minimum_core_version.is_empty() {
            let requirement = format!(">={}", manifest.minimum_core_version);
            if !DependencyResolver::version_satisfies(CORE_VERSION, &requirement) {
                return Err(HelixError::VersionGate {
                    what: "Core",
                    running: CORE_VERSION.to_string(),
                    required: manifest.minimum_core_version.clone(),
                });
            }
        }
        if !manifest.minimum_api_version.is_empty() {
            let requirement = format!(">={}", manifest.minimum_api_version);
            if !DependencyResolver::version_satisfies(API_VERSION, &requirement) {
                return Err(HelixError::VersionGate {
                    what: "API",
                    running: API_VERSION.to_string(),
                    required: manifest.minimum_api_version.clone(),
                });
            }
        }

        let name = manifest.name.clone();
        let destination = self.modules_dir.join(&name);

        // 重装：目标目录已存在时校验归属，启用中的旧实例先禁用
        if destination.exists() {
            if let Ok(existing) = ManifestParser::parse_file(&destination.join(MANIFEST_FILE)).await
            {
                if existing.name != name {
                    return Err(anyhow!(
                        "refusing to overwrite '{}': directory belongs to module '{}'",
                        destination.display(),
                        existing.name
                    )
                    .into());
                }
            }

            let old_state = self.module_state(&name).await;
            if matches!(old_state, Some(state) if state != ModuleState::Installed) {
                self.disable_module_inner(&name).await?;
            }

            tokio::fs::remove_dir_all(&destination).await?;
        }

        tokio::fs::rename(temp_dir, &destination).await?;
        tokio::fs::write(
            destination.join(INSTALL_MARKER),
            "installed_by=helixd\n",
        )
        .await?;

        // 登记（重装时先移除旧清单，避免解析器持有过期快照）
        {
            let mut resolver = self.resolver.write().await;
            resolver.remove(&name);
            resolver.add(manifest.clone())?;
        }
        self.registry
            .write()
            .await
            .insert(name.clone(), RegistryEntry::new(manifest, destination));

        Ok(name)
    }

    /// 卸载模块
    ///
    /// 被其他模块非可选依赖时拒绝；未处于 `Installed` 时先禁用；
    /// 随后删除安装目录并从注册表与解析器移除。
    pub async fn uninstall_module(&self, name: &str) -> Result<()> {
        self.ensure_initialized()?;

        let (state, install_path) = {
            let registry = self.registry.read().await;
            let entry = registry
                .get(name)
                .ok_or_else(|| HelixError::NotFound(name.to_string()))?;
            (entry.state, entry.install_path.clone())
        };

        let dependents = self.resolver.read().await.non_optional_dependents(name);
        if !dependents.is_empty() {
            return Err(HelixError::DependentsPresent {
                module: name.to_string(),
                dependents,
            });
        }

        if state != ModuleState::Installed {
            self.disable_module_inner(name).await?;
        }

        tokio::fs::remove_dir_all(&install_path).await?;

        self.resolver.write().await.remove(name);
        self.registry.write().await.remove(name);

        info!(module = %name, "模块卸载完成");
        Ok(())
    }

    // ==================== 生命周期操作 ====================

    /// 启用模块：解析依赖 → 启用并启动全部前置 → 加载目标 → 初始化
    ///
    /// 依赖问题不会把状态推进到 `Error`：目标保持 `Installed`，
    /// 错误里带上详细的 missing/circular 列表供用户处理后重试。
    pub async fn enable_module(&self, name: &str) -> Result<()> {
        self.ensure_initialized()?;

        let state = self
            .module_state(name)
            .await
            .ok_or_else(|| HelixError::NotFound(name.to_string()))?;
        if state != ModuleState::Installed {
            return Err(HelixError::BadState {
                module: name.to_string(),
                state: state.to_string(),
                operation: "enable".to_string(),
            });
        }

        let result = self.resolver.read().await.resolve(&[name.to_string()]);
        if !result.success {
            let err = if !result.missing.is_empty() {
                HelixError::DependencyMissing {
                    module: name.to_string(),
                    missing: result.missing,
                }
            } else {
                HelixError::DependencyCircular {
                    module: name.to_string(),
                    nodes: result.circular,
                }
            };
            self.record_error(name, &err).await;
            return Err(err);
        }

        // 前置按依赖序启用并拉起到 Running；目标自身最后处理。
        // load_order 保证每个前置的前置都排在更前面，所以无需递归。
        for dep_name in result.load_order.iter().filter(|n| n.as_str() != name) {
            if self.module_state(dep_name).await == Some(ModuleState::Installed) {
                if let Err(e) = self.enable_in_place(dep_name).await {
                    let err = anyhow!("failed to enable dependency '{}': {}", dep_name, e);
                    self.record_error(name, &err).await;
                    return Err(err.into());
                }
            }

            let dep_state = self.module_state(dep_name).await;
            if matches!(dep_state, Some(s) if s != ModuleState::Running && s.can_start()) {
                if let Err(e) = self.start_in_place(dep_name).await {
                    let err = anyhow!("failed to start dependency '{}': {}", dep_name, e);
                    self.record_error(name, &err).await;
                    return Err(err.into());
                }
            }
        }

        self.enable_in_place(name).await?;
        info!(module = %name, "模块启用成功");
        Ok(())
    }

    /// 对单个模块执行 load + init（不处理依赖）
    async fn enable_in_place(&self, name: &str) -> Result<()> {
        let (binary_path, entry_points) = {
            let registry = self.registry.read().await;
            let entry = registry
                .get(name)
                .ok_or_else(|| HelixError::NotFound(name.to_string()))?;
            (
                entry.install_path.join(&entry.manifest.binary_path),
                entry.manifest.entry_points.clone(),
            )
        };

        {
            let mut loader = self.loader.write().await;
            if let Err(e) = loader.load(&binary_path, name, &entry_points) {
                self.set_state(name, ModuleState::Installed, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        }
        self.set_state(name, ModuleState::Loaded, None).await;

        {
            let mut loader = self.loader.write().await;
            if let Err(e) = loader.initialize(name) {
                // 初始化失败：尽力卸载并回到 Installed
                if let Err(unload_err) = loader.unload(name) {
                    warn!(module = %name, error = %unload_err, "初始化失败后卸载也失败");
                }
                self.set_state(name, ModuleState::Installed, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        }
        self.set_state(name, ModuleState::Initialized, None).await;

        Ok(())
    }

    /// 启动模块：要求 `Initialized` 或 `Stopped`
    ///
    /// 失败不落入 `Error`：状态回到 `Initialized`，允许重试或禁用。
    pub async fn start_module(&self, name: &str) -> Result<()> {
        self.ensure_initialized()?;

        let state = self
            .module_state(name)
            .await
            .ok_or_else(|| HelixError::NotFound(name.to_string()))?;
        if !state.can_start() {
            return Err(HelixError::BadState {
                module: name.to_string(),
                state: state.to_string(),
                operation: "start".to_string(),
            });
        }

        self.start_in_place(name).await?;
        info!(module = %name, "模块启动成功");
        Ok(())
    }

    /// 对单个模块执行 start（假定状态允许）
    async fn start_in_place(&self, name: &str) -> Result<()> {
        let outcome = self.loader.write().await.start(name);
        match outcome {
            Ok(()) => {
                self.set_state(name, ModuleState::Running, None).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(name, ModuleState::Initialized, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// 停止模块：要求 `Running`
    ///
    /// 停止失败属于异常路径（模块 stop 返回非零），状态进入 `Error`。
    pub async fn stop_module(&self, name: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.stop_module_inner(name).await
    }

    async fn stop_module_inner(&self, name: &str) -> Result<()> {
        let state = self
            .module_state(name)
            .await
            .ok_or_else(|| HelixError::NotFound(name.to_string()))?;
        if !state.can_stop() {
            return Err(HelixError::BadState {
                module: name.to_string(),
                state: state.to_string(),
                operation: "stop".to_string(),
            });
        }

        let outcome = self.loader.write().await.stop(name);
        match outcome {
            Ok(()) => {
                self.set_state(name, ModuleState::Stopped, None).await;
                info!(module = %name, "模块停止成功");
                Ok(())
            }
            Err(e) => {
                self.set_state(name, ModuleState::Error, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// 禁用模块：运行中先停止，随后卸载（含 destroy），回到 `Installed`
    pub async fn disable_module(&self, name: &str) -> Result<()> {
        self.ensure_initialized()?;

        let state = self
            .module_state(name)
            .await
            .ok_or_else(|| HelixError::NotFound(name.to_string()))?;
        if state == ModuleState::Installed {
            return Err(HelixError::BadState {
                module: name.to_string(),
                state: state.to_string(),
                operation: "disable".to_string(),
            });
        }

        self.disable_module_inner(name).await?;
        info!(module = %name, "模块禁用成功");
        Ok(())
    }

    /// disable 的内部实现（关闭与卸载复用，跳过初始化检查）
    async fn disable_module_inner(&self, name: &str) -> Result<()> {
        if self.module_state(name).await == Some(ModuleState::Running) {
            self.stop_module_inner(name).await?;
        }

        // 句柄是否存活以加载器为准：Error 状态也可能残留句柄
        let loaded = self.loader.read().await.is_loaded(name);
        if loaded {
            let outcome = self.loader.write().await.unload(name);
            if let Err(e) = outcome {
                self.set_state(name, ModuleState::Error, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        }

        self.set_state(name, ModuleState::Installed, None).await;
        Ok(())
    }

    // ==================== 查询 ====================

    /// 单个模块的状态
    pub async fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.registry.read().await.get(name).map(|e| e.state)
    }

    /// 单个模块的注册表条目快照
    pub async fn module_info(&self, name: &str) -> Option<RegistryEntry> {
        self.registry.read().await.get(name).cloned()
    }

    /// 全部模块的（名称，状态）列表，按名称排序
    pub async fn list_modules(&self) -> Vec<(String, ModuleState)> {
        let registry = self.registry.read().await;
        let mut modules: Vec<(String, ModuleState)> = registry
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state))
            .collect();
        modules.sort_by(|a, b| a.0.cmp(&b.0));
        modules
    }

    /// 处于指定状态的模块名列表
    pub async fn list_modules_by_state(&self, state: ModuleState) -> Vec<String> {
        let registry = self.registry.read().await;
        let mut names: Vec<String> = registry
            .values()
            .filter(|e| e.state == state)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    /// 守护进程状态文本块
    pub async fn status_text(&self) -> String {
        let mut out = String::new();
        out.push_str("Helix Daemon Status:\n");
        out.push_str(&format!(
            "  Initialized: {}\n",
            if self.is_initialized() { "Yes" } else { "No" }
        ));
        out.push_str(&format!(
            "  Modules Directory: {}\n",
            self.modules_dir.display()
        ));
        out.push_str(&format!(
            "  Total Modules: {}\n",
            self.registry.read().await.len()
        ));

        for state in [
            ModuleState::Installed,
            ModuleState::Loaded,
            ModuleState::Initialized,
            ModuleState::Running,
            ModuleState::Stopped,
            ModuleState::Error,
        ] {
            let modules = self.list_modules_by_state(state).await;
            if !modules.is_empty() {
                out.push_str(&format!("  {}: {}\n", state, modules.len()));
            }
        }

        out
    }

    /// 重新扫描模块根目录（幂等）
    pub async fn refresh_modules(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.scan_modules_directory().await;
        Ok(())
    }

    // ==================== 内部辅助 ====================

    /// 更新条目状态与错误信息，并维护时间戳
    async fn set_state(&self, name: &str, state: ModuleState, error: Option<String>) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.get_mut(name) {
            entry.state = state;
            entry.last_error = error;

            match state {
                ModuleState::Loaded => entry.loaded_at = Some(Utc::now()),
                ModuleState::Running => entry.started_at = Some(Utc::now()),
                _ => {}
            }
        }
        debug!(module = %name, state = %state, "模块状态更新");
    }

    /// 仅记录错误信息，不改变状态
    async fn record_error(&self, name: &str, error: &(dyn std::fmt::Display + Send + Sync)) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.get_mut(name) {
            entry.last_error = Some(error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::manifest::Dependency;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// 构造 .helx 测试包
    fn write_helx(dir: &Path, file_name: &str, manifest: &ModuleManifest) -> PathBuf {
        let path = dir.join(file_name);
        let file = std::fs::File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let manifest_json = ManifestParser::serialize_manifest(manifest).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "manifest.json", manifest_json.as_bytes())
            .unwrap();

        let binary: &[u8] = b"\x7fELF-not-really";
        let mut header = tar::Header::new_gnu();
        header.set_size(binary.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, manifest.binary_path.as_str(), binary)
            .unwrap();

        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    /// 建好目录并完成初始化的守护进程
    async fn daemon_in(dir: &Path) -> HelixDaemon {
        let daemon = HelixDaemon::new(dir.join("modules"));
        daemon.initialize().await.unwrap();
        daemon
    }

    fn simple_manifest(name: &str) -> ModuleManifest {
        ModuleManifest::new(name, "1.0.0", format!("lib{}.so", name))
    }

    #[tokio::test]
    async fn test_operations_require_initialization() {
        let daemon = HelixDaemon::new("./modules-test-uninit");

        let result = daemon.install_module(Path::new("x.helx")).await;
        assert!(matches!(result, Err(HelixError::NotInitialized)));

        let result = daemon.enable_module("x").await;
        assert!(matches!(result, Err(HelixError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_double_initialize_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        assert!(daemon.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_install_creates_layout_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;
        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));

        daemon.install_module(&package).await.unwrap();

        let install_dir = daemon.modules_dir().join("hello");
        assert!(install_dir.join("manifest.json").is_file());
        assert!(install_dir.join("libhello.so").is_file());
        assert!(install_dir.join(INSTALL_MARKER).is_file());

        let info = daemon.module_info("hello").await.unwrap();
        assert_eq!(info.state, ModuleState::Installed);
        assert_eq!(info.version, "1.0.0");
        assert_eq!(info.install_path, install_dir);

        // 临时目录不残留
        let leftovers: Vec<_> = std::fs::read_dir(daemon.modules_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_install_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_wrong_extension() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let bogus = dir.path().join("module.tar.gz");
        std::fs::write(&bogus, b"whatever").unwrap();

        let result = daemon.install_module(&bogus).await;
        assert!(matches!(result, Err(HelixError::ExtractFailed(_))));
    }

    #[tokio::test]
    async fn test_install_version_gate_message() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let mut manifest = simple_manifest("future");
        manifest.minimum_core_version = "9.9.9".to_string();
        let package = write_helx(dir.path(), "future.helx", &manifest);

        let err = daemon.install_module(&package).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Core version 2.0.0 does not satisfy >=9.9.9"
        );

        // 模块根目录下除状态文件外不残留任何东西
        assert!(!daemon.modules_dir().join("future").exists());
        assert!(daemon.module_info("future").await.is_none());
    }

    #[tokio::test]
    async fn test_install_api_version_gate() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let mut manifest = simple_manifest("apifuture");
        manifest.minimum_api_version = "9.0.0".to_string();
        let package = write_helx(dir.path(), "apifuture.helx", &manifest);

        let err = daemon.install_module(&package).await.unwrap_err();
        assert!(err.to_string().starts_with("API version"));
    }

    #[tokio::test]
    async fn test_install_satisfied_gates_pass() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let mut manifest = simple_manifest("modern");
        manifest.minimum_core_version = "1.0.0".to_string();
        manifest.minimum_api_version = "1.0.0".to_string();
        let package = write_helx(dir.path(), "modern.helx", &manifest);

        daemon.install_module(&package).await.unwrap();
        assert_eq!(
            daemon.module_state("modern").await,
            Some(ModuleState::Installed)
        );
    }

    #[tokio::test]
    async fn test_reinstall_same_module_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();

        let mut v2 = simple_manifest("hello");
        v2.version = "2.0.0".to_string();
        let package2 = write_helx(dir.path(), "hello2.helx", &v2);
        daemon.install_module(&package2).await.unwrap();

        let info = daemon.module_info("hello").await.unwrap();
        assert_eq!(info.version, "2.0.0");
        assert_eq!(info.state, ModuleState::Installed);
    }

    #[tokio::test]
    async fn test_install_refuses_foreign_directory() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        // 预置一个同名目录，但其中的清单属于别的模块
        let squatter = daemon.modules_dir().join("hello");
        std::fs::create_dir_all(&squatter).unwrap();
        std::fs::write(
            squatter.join("manifest.json"),
            br#"{"name": "other", "version": "1.0.0", "binary_path": "libother.so"}"#,
        )
        .unwrap();

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        let err = daemon.install_module(&package).await.unwrap_err();
        assert!(err.to_string().contains("belongs to module 'other'"));

        // 原目录内容未被破坏
        assert!(squatter.join("manifest.json").is_file());
    }

    #[tokio::test]
    async fn test_enable_missing_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let mut manifest = simple_manifest("p");
        manifest.dependencies.push(Dependency::new("q", ">=1.0.0"));
        let package = write_helx(dir.path(), "p.helx", &manifest);
        daemon.install_module(&package).await.unwrap();

        let err = daemon.enable_module("p").await.unwrap_err();
        assert!(err.to_string().contains("missing: q"), "{}", err);
        assert_eq!(daemon.module_state("p").await, Some(ModuleState::Installed));

        // last_error 对 info 可见
        let info = daemon.module_info("p").await.unwrap();
        assert!(info.last_error.unwrap().contains("missing: q"));
    }

    #[tokio::test]
    async fn test_enable_circular_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let mut x = simple_manifest("x");
        x.dependencies.push(Dependency::new("y", ""));
        let mut y = simple_manifest("y");
        y.dependencies.push(Dependency::new("x", ""));

        daemon
            .install_module(&write_helx(dir.path(), "x.helx", &x))
            .await
            .unwrap();
        daemon
            .install_module(&write_helx(dir.path(), "y.helx", &y))
            .await
            .unwrap();

        let err = daemon.enable_module("x").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("circular"), "{}", msg);
        assert!(msg.contains('x') && msg.contains('y'));

        assert_eq!(daemon.module_state("x").await, Some(ModuleState::Installed));
        assert_eq!(daemon.module_state("y").await, Some(ModuleState::Installed));
    }

    #[tokio::test]
    async fn test_enable_load_failure_keeps_installed() {
        // 包里的 "动态库" 不是合法 ELF，load 必然失败
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();

        let err = daemon.enable_module("hello").await.unwrap_err();
        assert!(matches!(err, HelixError::LoadFailed { .. }));
        assert_eq!(
            daemon.module_state("hello").await,
            Some(ModuleState::Installed)
        );
        assert!(daemon
            .module_info("hello")
            .await
            .unwrap()
            .last_error
            .is_some());
    }

    #[tokio::test]
    async fn test_enable_unknown_module() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let result = daemon.enable_module("ghost").await;
        assert!(matches!(result, Err(HelixError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_requires_enabled_state() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();

        let result = daemon.start_module("hello").await;
        assert!(matches!(result, Err(HelixError::BadState { .. })));
    }

    #[tokio::test]
    async fn test_stop_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();

        let result = daemon.stop_module("hello").await;
        assert!(matches!(result, Err(HelixError::BadState { .. })));
    }

    #[tokio::test]
    async fn test_disable_already_installed() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();

        let result = daemon.disable_module("hello").await;
        assert!(matches!(result, Err(HelixError::BadState { .. })));
    }

    #[tokio::test]
    async fn test_uninstall_blocked_by_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        daemon
            .install_module(&write_helx(dir.path(), "a.helx", &simple_manifest("a")))
            .await
            .unwrap();
        let mut b = simple_manifest("b");
        b.dependencies.push(Dependency::new("a", ">=1.0.0"));
        daemon
            .install_module(&write_helx(dir.path(), "b.helx", &b))
            .await
            .unwrap();

        let err = daemon.uninstall_module("a").await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot uninstall 'a': required by b");

        // 注册表与文件系统不受影响
        assert_eq!(daemon.module_state("a").await, Some(ModuleState::Installed));
        assert!(daemon.modules_dir().join("a").exists());
    }

    #[tokio::test]
    async fn test_uninstall_allowed_for_optional_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        daemon
            .install_module(&write_helx(dir.path(), "a.helx", &simple_manifest("a")))
            .await
            .unwrap();
        let mut b = simple_manifest("b");
        b.dependencies.push(Dependency::new("a", "").optional());
        daemon
            .install_module(&write_helx(dir.path(), "b.helx", &b))
            .await
            .unwrap();

        daemon.uninstall_module("a").await.unwrap();
        assert!(daemon.module_info("a").await.is_none());
    }

    #[tokio::test]
    async fn test_install_uninstall_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();
        daemon.uninstall_module("hello").await.unwrap();

        assert!(daemon.module_info("hello").await.is_none());
        assert!(!daemon.modules_dir().join("hello").exists());

        // 模块根目录里只可能剩状态边车
        let entries: Vec<String> = std::fs::read_dir(daemon.modules_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n != persistence::STATE_FILE_NAME)
            .collect();
        assert!(entries.is_empty(), "unexpected leftovers: {:?}", entries);
    }

    #[tokio::test]
    async fn test_uninstall_unknown_module() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let result = daemon.uninstall_module("ghost").await;
        assert!(matches!(result, Err(HelixError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_scan_registers_marked_directories_only() {
        let dir = tempfile::tempdir().unwrap();
        let modules_dir = dir.path().join("modules");
        std::fs::create_dir_all(&modules_dir).unwrap();

        // 带标记的合法模块目录
        let good = modules_dir.join("good");
        std::fs::create_dir_all(&good).unwrap();
        std::fs::write(
            good.join("manifest.json"),
            br#"{"name": "good", "version": "1.0.0", "binary_path": "libgood.so"}"#,
        )
        .unwrap();
        std::fs::write(good.join(INSTALL_MARKER), "installed_by=helixd\n").unwrap();

        // 无标记目录：忽略
        let stray = modules_dir.join("stray");
        std::fs::create_dir_all(&stray).unwrap();
        std::fs::write(
            stray.join("manifest.json"),
            br#"{"name": "stray", "version": "1.0.0", "binary_path": "libstray.so"}"#,
        )
        .unwrap();

        // 带标记但清单损坏：忽略
        let broken = modules_dir.join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("manifest.json"), b"{").unwrap();
        std::fs::write(broken.join(INSTALL_MARKER), "installed_by=helixd\n").unwrap();

        let daemon = HelixDaemon::new(&modules_dir);
        daemon.initialize().await.unwrap();

        let modules = daemon.list_modules().await;
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].0, "good");
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();

        daemon.refresh_modules().await.unwrap();
        daemon.refresh_modules().await.unwrap();

        assert_eq!(daemon.list_modules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_persists_states_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();

        daemon.shutdown().await;

        assert!(!daemon.is_initialized());
        assert!(persistence::state_file_path(daemon.modules_dir()).is_file());
        // 文件仍在磁盘上
        assert!(daemon.modules_dir().join("hello").exists());

        let saved = persistence::load_states(daemon.modules_dir()).await;
        assert_eq!(saved.get("hello"), Some(&ModuleState::Installed));
    }

    #[tokio::test]
    async fn test_restart_rescans_installed_modules() {
        let dir = tempfile::tempdir().unwrap();
        let modules_dir = dir.path().join("modules");

        {
            let daemon = HelixDaemon::new(&modules_dir);
            daemon.initialize().await.unwrap();
            let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
            daemon.install_module(&package).await.unwrap();
            daemon.shutdown().await;
        }

        let daemon = HelixDaemon::new(&modules_dir);
        daemon.initialize().await.unwrap();

        assert_eq!(
            daemon.module_state("hello").await,
            Some(ModuleState::Installed)
        );
    }

    #[tokio::test]
    async fn test_status_text_shape() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let package = write_helx(dir.path(), "hello.helx", &simple_manifest("hello"));
        daemon.install_module(&package).await.unwrap();

        let status = daemon.status_text().await;
        assert!(status.starts_with("Helix Daemon Status:\n"));
        assert!(status.contains("  Initialized: Yes\n"));
        assert!(status.contains("  Total Modules: 1\n"));
        assert!(status.contains("  Installed: 1\n"));
    }
}
