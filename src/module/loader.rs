//! 模块动态加载器
//!
//! 负责打开模块动态库、解析四个生命周期入口符号并驱动调用。
//!
//! # 加载约定
//!
//! - 库以 `RTLD_LAZY | RTLD_GLOBAL` 打开：延迟绑定，且导出符号全局可见，
//!   使后加载的模块能看到先加载模块的 C-ABI 导出（例如日志接收器）。
//! - 生命周期函数返回 0 表示成功，非零原样上报。
//! - 模块代码抛出的信号/异常不做捕获；核心假定模块是协作的，
//!   这是文档化的信任边界。
//! - 所有操作都在控制线程上串行执行。

use std::collections::HashMap;
use std::os::raw::c_int;
use std::path::Path;

use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_LAZY};
use tracing::{debug, info, warn};

use crate::module::manifest::EntryPoints;
use crate::utils::{HelixError, Result};

/// 返回 int 的生命周期函数（init/start/stop）
type LifecycleFn = unsafe extern "C" fn() -> c_int;

/// 无返回值的生命周期函数（destroy）
type DestroyFn = unsafe extern "C" fn();

/// 一个已加载模块：库句柄 + 四个已解析的入口 + 运行标志
///
/// 句柄与函数指针同生共死：指针仅在 `library` 存活期间有效，
/// 二者共同封装在本结构中，随 unload 一起释放。
pub struct LoadedModule {
    library: Library,
    init: LifecycleFn,
    start: LifecycleFn,
    stop: LifecycleFn,
    destroy: DestroyFn,
    initialized: bool,
    running: bool,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("initialized", &self.initialized)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

/// 模块加载器
///
/// 维护 `模块名 -> LoadedModule` 的存活句柄表。
#[derive(Debug, Default)]
pub struct ModuleLoader {
    loaded: HashMap<String, LoadedModule>,
}

impl ModuleLoader {
    /// 创建新的加载器
    pub fn new() -> Self {
        Self::default()
    }

    /// 加载模块动态库并解析入口符号
    ///
    /// # Arguments
    ///
    /// * `path` - 动态库文件的完整路径
    /// * `name` - 模块名（句柄表的键）
    /// * `entry_points` - 四个入口符号名
    ///
    /// # Errors
    ///
    /// - 重复加载返回 `AlreadyPresent`
    /// - 打开失败返回 `LoadFailed`
    /// - 任一符号缺失返回 `SymbolMissing`（指明缺失符号），句柄随即释放
    pub fn load(&mut self, path: &Path, name: &str, entry_points: &EntryPoints) -> Result<()> {
        if self.loaded.contains_key(name) {
            return Err(HelixError::AlreadyPresent(name.to_string()));
        }

        let library = unsafe { Library::open(Some(path), RTLD_LAZY | RTLD_GLOBAL) }.map_err(
            |e| HelixError::LoadFailed {
                module: name.to_string(),
                reason: e.to_string(),
            },
        )?;

        let init = Self::resolve_int_fn(&library, name, &entry_points.init)?;
        let start = Self::resolve_int_fn(&library, name, &entry_points.start)?;
        let stop = Self::resolve_int_fn(&library, name, &entry_points.stop)?;
        let destroy = Self::resolve_destroy_fn(&library, name, &entry_points.destroy)?;

        self.loaded.insert(
            name.to_string(),
            LoadedModule {
                library,
                init,
                start,
                stop,
                destroy,
                initialized: false,
                running: false,
            },
        );

        info!(module = %name, path = %path.display(), "模块动态库加载完成");
        Ok(())
    }

    /// 调用模块 init
    pub fn initialize(&mut self, name: &str) -> Result<()> {
        let module = self.get_mut(name)?;

        if module.initialized {
            return Err(HelixError::BadState {
                module: name.to_string(),
                state: "initialized".to_string(),
                operation: "init".to_string(),
            });
        }

        let code = unsafe { (module.init)() };
        if code != 0 {
            return Err(HelixError::ModuleCallFailed {
                module: name.to_string(),
                entry: "init",
                code,
            });
        }

        module.initialized = true;
        debug!(module = %name, "init 成功");
        Ok(())
    }

    /// 调用模块 start
    ///
    /// 要求已初始化且未运行。
    pub fn start(&mut self, name: &str) -> Result<()> {
        let module = self.get_mut(name)?;

        if !module.initialized {
            return Err(HelixError::BadState {
                module: name.to_string(),
                state: "not initialized".to_string(),
                operation: "start".to_string(),
            });
        }
        if module.running {
            return Err(HelixError::BadState {
                module: name.to_string(),
                state: "running".to_string(),
                operation: "start".to_string(),
            });
        }

        let code = unsafe { (module.start)() };
        if code != 0 {
            return Err(HelixError::ModuleCallFailed {
                module: name.to_string(),
                entry: "start",
                code,
            });
        }

        module.running = true;
        debug!(module = %name, "start 成功");
        Ok(())
    }

    /// 调用模块 stop
    ///
    /// 要求正在运行。
    pub fn stop(&mut self, name: &str) -> Result<()> {
        let module = self.get_mut(name)?;

        if !module.running {
            return Err(HelixError::BadState {
                module: name.to_string(),
                state: "not running".to_string(),
                operation: "stop".to_string(),
            });
        }

        let code = unsafe { (module.stop)() };
        if code != 0 {
            return Err(HelixError::ModuleCallFailed {
                module: name.to_string(),
                entry: "stop",
                code,
            });
        }

        module.running = false;
        debug!(module = %name, "stop 成功");
        Ok(())
    }

    /// 卸载模块
    ///
    /// 释放顺序：运行中则先 stop（尽力而为）→ 已初始化则调用 destroy →
    /// 关闭库句柄。
    pub fn unload(&mut self, name: &str) -> Result<()> {
        let mut module = self
            .loaded
            .remove(name)
            .ok_or_else(|| HelixError::NotFound(name.to_string()))?;

        if module.running {
            let code = unsafe { (module.stop)() };
            if code != 0 {
                warn!(module = %name, code, "卸载时 stop 返回非零，继续卸载");
            }
            module.running = false;
        }

        if module.initialized {
            unsafe { (module.destroy)() };
        }

        module.library.close().map_err(|e| HelixError::LoadFailed {
            module: name.to_string(),
            reason: e.to_string(),
        })?;

        info!(module = %name, "模块已卸载");
        Ok(())
    }

    /// 模块是否已加载
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    /// 模块是否正在运行
    pub fn is_running(&self, name: &str) -> bool {
        self.loaded.get(name).map(|m| m.running).unwrap_or(false)
    }

    /// 已加载模块名列表
    pub fn loaded_modules(&self) -> Vec<String> {
        self.loaded.keys().cloned().collect()
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut LoadedModule> {
        self.loaded
            .get_mut(name)
            .ok_or_else(|| HelixError::NotFound(name.to_string()))
    }

    /// 解析 `int (*)(void)` 符号
    fn resolve_int_fn(library: &Library, module: &str, symbol: &str) -> Result<LifecycleFn> {
        let mut bytes = symbol.as_bytes().to_vec();
        bytes.push(0);
        unsafe { library.get::<LifecycleFn>(&bytes) }
            .map(|s| *s)
            .map_err(|_| HelixError::SymbolMissing {
                module: module.to_string(),
                symbol: symbol.to_string(),
            })
    }

    /// 解析 `void (*)(void)` 符号
    fn resolve_destroy_fn(library: &Library, module: &str, symbol: &str) -> Result<DestroyFn> {
        let mut bytes = symbol.as_bytes().to_vec();
        bytes.push(0);
        unsafe { library.get::<DestroyFn>(&bytes) }
            .map(|s| *s)
            .map_err(|_| HelixError::SymbolMissing {
                module: module.to_string(),
                symbol: symbol.to_string(),
            })
    }
}
