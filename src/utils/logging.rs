//! 模块日志注册中心
//!
//! 面向模块的进程级日志分发服务。模块通过动态符号
//! （`RTLD_DEFAULT` 查找守护进程导出的 C-ABI 函数）接入：
//!
//! - `helix_log_dispatch` - 生产端入口
//! - `helix_log_register_sink` / `helix_log_unregister_sink` - 接收器注册
//! - `helix_log_stats_get` / `helix_log_min_level_set` / `helix_log_min_level_get`
//!
//! # 行为契约
//!
//! - 无接收器时消息进入有界 FIFO 队列，溢出丢弃新消息并计数
//! - 有接收器且级别低于阈值时过滤并计数
//! - 分发时在锁内取接收器快照、在锁外扇出，接收器自身可以再打日志
//! - 注册接收器时若队列非空，按生产顺序重过滤并排空
//!
//! 队列容量与最低级别在单例首次构造时读取环境变量
//! `HELIX_LOG_QUEUE_CAP`（默认 256）与 `HELIX_LOG_MIN_LEVEL`（默认 1），
//! 且只读取一次。
//!
//! 注意：接收器不得在收到消息的同一调用栈里紧密循环地再次打日志，
//! 扇出没有深度限制。
//!
//! 本模块与守护进程自身的 tracing 日志互相独立。

use std::collections::VecDeque;
use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// 日志级别：0=Debug, 1=Info, 2=Warn, 3=Error
pub const LEVEL_DEBUG: i32 = 0;
/// Info 级别
pub const LEVEL_INFO: i32 = 1;
/// Warn 级别
pub const LEVEL_WARN: i32 = 2;
/// Error 级别
pub const LEVEL_ERROR: i32 = 3;

/// 默认队列容量
const DEFAULT_QUEUE_CAP: usize = 256;

/// 默认最低级别（Info）
const DEFAULT_MIN_LEVEL: i32 = LEVEL_INFO;

/// 队列容量环境变量
const ENV_QUEUE_CAP: &str = "HELIX_LOG_QUEUE_CAP";

/// 最低级别环境变量
const ENV_MIN_LEVEL: &str = "HELIX_LOG_MIN_LEVEL";

/// 接收器函数指针：`void (*)(const char* module, int level, const char* message)`
pub type LogSink = unsafe extern "C" fn(*const c_char, c_int, *const c_char);

/// 统计快照（与 C 侧 `HelixLogStats` 布局一致）
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    /// 通过过滤并扇出的消息总数
    pub dispatched: u64,
    /// 任何原因被丢弃的消息总数
    pub dropped: u64,
    /// 因队列溢出被丢弃的消息数
    pub dropped_overflow: u64,
    /// 因级别过滤被丢弃的消息数
    pub dropped_filtered: u64,
    /// 当前队列中的消息数
    pub queued: u64,
    /// 队列容量
    pub queue_capacity: u64,
    /// 已注册接收器数量
    pub sinks: u64,
    /// 当前最低级别
    pub min_level: i32,
}

/// 锁保护的可变部分：接收器列表 + 预接收队列
struct RegistryInner {
    sinks: Vec<LogSink>,
    queue: VecDeque<(String, i32, String)>,
}

/// 日志注册中心
///
/// 进程中只有一个全局实例（[`registry`]），但结构本身可独立构造
/// 以便测试隔离。
pub struct LogRegistry {
    inner: Mutex<RegistryInner>,
    capacity: usize,
    min_level: AtomicI32,
    dispatched: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_filtered: AtomicU64,
}

impl LogRegistry {
    /// 用显式参数构造（测试用）
    pub fn with_config(capacity: usize, min_level: i32) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sinks: Vec::new(),
                queue: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            min_level: AtomicI32::new(clamp_level(min_level)),
            dispatched: AtomicU64::new(0),
            dropped_overflow: AtomicU64::new(0),
            dropped_filtered: AtomicU64::new(0),
        }
    }

    /// 从环境变量构造（单例路径，仅执行一次）
    fn from_env() -> Self {
        let capacity = std::env::var(ENV_QUEUE_CAP)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_QUEUE_CAP);

        let min_level = std::env::var(ENV_MIN_LEVEL)
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(DEFAULT_MIN_LEVEL);

        Self::with_config(capacity, min_level)
    }

    /// 分发一条日志消息
    ///
    /// 无接收器时入队（满则丢弃新消息）；有接收器时先过滤再扇出。
    pub fn dispatch(&self, module: &str, level: i32, message: &str) {
        let sinks: Vec<LogSink> = {
            let mut inner = self.inner.lock().unwrap();

            if inner.sinks.is_empty() {
                if inner.queue.len() >= self.capacity {
                    self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                } else {
                    inner
                        .queue
                        .push_back((module.to_string(), level, message.to_string()));
                }
                return;
            }

            if level < self.min_level.load(Ordering::Relaxed) {
                self.dropped_filtered.fetch_add(1, Ordering::Relaxed);
                return;
            }

            inner.sinks.clone()
        };

        // 锁外扇出：接收器可能重入 dispatch
        fan_out(&sinks, module, level, message);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// 注册接收器（按函数指针身份去重）
    ///
    /// 注册后若队列非空，按生产顺序重过滤并排空到当前全部接收器。
    pub fn register_sink(&self, sink: LogSink) {
        let (sinks, drained) = {
            let mut inner = self.inner.lock().unwrap();

            if !inner.sinks.iter().any(|s| *s as usize == sink as usize) {
                inner.sinks.push(sink);
            }

            if inner.queue.is_empty() {
                return;
            }

            let drained: Vec<_> = inner.queue.drain(..).collect();
            (inner.sinks.clone(), drained)
        };

        let min_level = self.min_level.load(Ordering::Relaxed);
        for (module, level, message) in drained {
            if level < min_level {
                self.dropped_filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            fan_out(&sinks, &module, level, &message);
            self.dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 注销接收器（幂等）
    pub fn unregister_sink(&self, sink: LogSink) {
        let mut inner = self.inner.lock().unwrap();
        inner.sinks.retain(|s| *s as usize != sink as usize);
    }

    /// 统计快照
    pub fn stats(&self) -> LogStats {
        let (queued, sinks) = {
            let inner = self.inner.lock().unwrap();
            (inner.queue.len() as u64, inner.sinks.len() as u64)
        };

        let dropped_overflow = self.dropped_overflow.load(Ordering::Relaxed);
        let dropped_filtered = self.dropped_filtered.load(Ordering::Relaxed);

        LogStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: dropped_overflow + dropped_filtered,
            dropped_overflow,
            dropped_filtered,
            queued,
            queue_capacity: self.capacity as u64,
            sinks,
            min_level: self.min_level.load(Ordering::Relaxed),
        }
    }

    /// 设置最低级别（收敛到 0..=3）
    pub fn set_min_level(&self, level: i32) {
        self.min_level.store(clamp_level(level), Ordering::Relaxed);
    }

    /// 读取最低级别
    pub fn min_level(&self) -> i32 {
        self.min_level.load(Ordering::Relaxed)
    }
}

/// 把级别收敛到 `[0, 3]`
fn clamp_level(level: i32) -> i32 {
    level.clamp(LEVEL_DEBUG, LEVEL_ERROR)
}

/// 扇出到接收器快照
fn fan_out(sinks: &[LogSink], module: &str, level: i32, message: &str) {
    // 含内嵌 NUL 的字符串无法跨 C 边界，此处截断处理
    let module = CString::new(module).unwrap_or_default();
    let message = CString::new(message).unwrap_or_default();

    for sink in sinks.iter().copied() {
        unsafe { sink(module.as_ptr(), level, message.as_ptr()) };
    }
}

/// 进程级单例
///
/// 首次调用时构造并读取环境变量，之后恒定。
pub fn registry() -> &'static LogRegistry {
    static REGISTRY: OnceLock<LogRegistry> = OnceLock::new();
    REGISTRY.get_or_init(LogRegistry::from_env)
}

// ============================================================================
// C-ABI 导出（模块侧通过 RTLD_DEFAULT 发现）
// ============================================================================

/// 把 C 字符串转成 &str；空指针与非 UTF-8 做降级处理
unsafe fn cstr_or<'a>(ptr: *const c_char, fallback: &'a str) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return std::borrow::Cow::Borrowed(fallback);
    }
    CStr::from_ptr(ptr).to_string_lossy()
}

/// 生产端入口：`void helix_log_dispatch(const char*, int, const char*)`
///
/// # Safety
///
/// `module` 与 `message` 为 NUL 结尾的 C 字符串或空指针。
#[no_mangle]
pub unsafe extern "C" fn helix_log_dispatch(
    module: *const c_char,
    level: c_int,
    message: *const c_char,
) {
    let module = cstr_or(module, "(unknown)");
    let message = cstr_or(message, "");
    registry().dispatch(&module, level, &message);
}

/// 注册接收器：`void helix_log_register_sink(void (*)(const char*, int, const char*))`
///
/// # Safety
///
/// `sink` 必须是签名匹配且在注销前一直有效的函数指针。
#[no_mangle]
pub unsafe extern "C" fn helix_log_register_sink(sink: Option<LogSink>) {
    if let Some(sink) = sink {
        registry().register_sink(sink);
    }
}

/// 注销接收器（幂等）
///
/// # Safety
///
/// 同 [`helix_log_register_sink`]。
#[no_mangle]
pub unsafe extern "C" fn helix_log_unregister_sink(sink: Option<LogSink>) {
    if let Some(sink) = sink {
        registry().unregister_sink(sink);
    }
}

/// 统计快照：`void helix_log_stats_get(HelixLogStats*)`
///
/// # Safety
///
/// `out` 为指向可写 `HelixLogStats` 的指针或空指针。
#[no_mangle]
pub unsafe extern "C" fn helix_log_stats_get(out: *mut LogStats) {
    if out.is_null() {
        return;
    }
    *out = registry().stats();
}

/// 设置最低级别
#[no_mangle]
pub extern "C" fn helix_log_min_level_set(level: c_int) {
    registry().set_min_level(level);
}

/// 读取最低级别
#[no_mangle]
pub extern "C" fn helix_log_min_level_get() -> c_int {
    registry().min_level()
}
