//! 守护进程配置
//!
//! 定义 helixd 的配置结构和加载逻辑。配置文件支持 YAML 与 JSON，
//! 按扩展名区分；所有字段都有默认值，命令行参数可覆盖。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 默认模块根目录
fn default_modules_dir() -> PathBuf {
    PathBuf::from("./modules")
}

/// 默认控制 socket 路径
fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/helixd.sock")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 日志配置（守护进程自身的 tracing 日志）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
        }
    }
}

/// 守护进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// 配置文件路径（仅记录来源，不参与序列化）
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 模块根目录
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// 控制 socket 路径
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            modules_dir: default_modules_dir(),
            socket_path: default_socket_path(),
            logging: LogConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// 创建配置构建器
    pub fn builder() -> DaemonConfigBuilder {
        DaemonConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// 扩展名为 `.json` 时按 JSON 解析，否则按 YAML 解析。
    pub async fn from_file(path: impl Into<PathBuf>) -> crate::utils::Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await?;

        let mut config: DaemonConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        Ok(config)
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct DaemonConfigBuilder {
    config: DaemonConfig,
}

impl DaemonConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: DaemonConfig::default(),
        }
    }

    /// 设置模块根目录
    pub fn modules_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.modules_dir = dir.into();
        self
    }

    /// 设置控制 socket 路径
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> DaemonConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.modules_dir, PathBuf::from("./modules"));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/helixd.sock"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_builder() {
        let config = DaemonConfig::builder()
            .modules_dir("/var/lib/helix/modules")
            .socket_path("/run/helixd/helixd.sock")
            .log_level("debug")
            .build();

        assert_eq!(config.modules_dir, PathBuf::from("/var/lib/helix/modules"));
        assert_eq!(config.socket_path, PathBuf::from("/run/helixd/helixd.sock"));
        assert_eq!(config.logging.level, "debug");
    }

    #[tokio::test]
    async fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(
            &path,
            "modules_dir: /opt/helix/modules\nlogging:\n  level: warn\n",
        )
        .await
        .unwrap();

        let config = DaemonConfig::from_file(&path).await.unwrap();
        assert_eq!(config.modules_dir, PathBuf::from("/opt/helix/modules"));
        assert_eq!(config.logging.level, "warn");
        // 未出现的字段保持默认
        assert_eq!(config.socket_path, PathBuf::from("/tmp/helixd.sock"));
    }

    #[tokio::test]
    async fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"socket_path": "/tmp/custom.sock"}"#)
            .await
            .unwrap();

        let config = DaemonConfig::from_file(&path).await.unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/custom.sock"));
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = DaemonConfig::builder().log_level("trace").build();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: DaemonConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.logging.level, "trace");
    }
}
