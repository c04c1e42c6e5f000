//! 模块清单解析器
//!
//! 负责从 `manifest.json` 解析 [`ModuleManifest`] 并做格式校验。
//!
//! # 校验规则
//!
//! 解析成功的前提是以下条件全部成立：
//!
//! - `name` 符合标识符格式（字母开头，仅含字母、数字、下划线、连字符，最长 64）
//! - `version` 与各 `minimum_*_version` 为合法 semver
//! - `binary_path` 非空，且不得逃逸安装目录（拒绝绝对路径与 `..` 分量）
//! - 每条依赖：名称合法；版本要求为空或为「运算符 + semver」/裸 semver
//! - 非默认入口符号为合法 C 标识符（最长 128）

use std::path::{Component, Path};

use crate::module::dependency::DependencyResolver;
use crate::module::manifest::ModuleManifest;
use crate::utils::{HelixError, Result};

/// 模块名最大长度
const MAX_MODULE_NAME_LEN: usize = 64;

/// 入口符号最大长度
const MAX_SYMBOL_LEN: usize = 128;

/// 模块清单解析器
///
/// 提供从文件或字节串解析 `manifest.json` 的功能，
/// 以及供外部工具（如 helx 编译器）使用的合法性判定与确定性序列化。
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    /// 从文件解析模块清单
    ///
    /// # Arguments
    ///
    /// * `path` - `manifest.json` 文件路径
    ///
    /// # Errors
    ///
    /// - 文件不存在或无法读取时返回 IO 错误
    /// - JSON 不合法或校验失败时返回 `ManifestInvalid`
    pub async fn parse_file(path: &Path) -> Result<ModuleManifest> {
        let content = tokio::fs::read(path).await?;
        Self::parse_bytes(&content)
    }

    /// 从文件同步解析模块清单
    pub fn parse_file_sync(path: &Path) -> Result<ModuleManifest> {
        let content = std::fs::read(path)?;
        Self::parse_bytes(&content)
    }

    /// 从 JSON 字节串解析模块清单
    ///
    /// 未知字段被忽略；缺少必填字段（name/version/binary_path）直接报错。
    pub fn parse_bytes(content: &[u8]) -> Result<ModuleManifest> {
        let manifest: ModuleManifest = serde_json::from_slice(content)
            .map_err(|e| HelixError::ManifestInvalid(e.to_string()))?;
        Self::validate(&manifest)?;
        Ok(manifest)
    }

    /// 校验模块清单
    ///
    /// 收集所有违规项后合并为一条 `ManifestInvalid` 错误返回。
    pub fn validate(manifest: &ModuleManifest) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // 1. 模块名
        if !Self::is_valid_module_name(&manifest.name) {
            errors.push(format!("invalid module name: '{}'", manifest.name));
        }

        // 2. 版本号
        if semver::Version::parse(&manifest.version).is_err() {
            errors.push(format!("invalid version format: '{}'", manifest.version));
        }

        // 3. 二进制路径：非空且必须落在安装目录内
        if manifest.binary_path.is_empty() {
            errors.push("binary_path cannot be empty".to_string());
        } else if !Self::is_confined_relative_path(&manifest.binary_path) {
            errors.push(format!(
                "binary_path '{}' escapes the install directory",
                manifest.binary_path
            ));
        }

        // 4. 版本门禁字段
        for (field, value) in [
            ("minimum_core_version", &manifest.minimum_core_version),
            ("minimum_api_version", &manifest.minimum_api_version),
        ] {
            if !value.is_empty() && semver::Version::parse(value).is_err() {
                errors.push(format!("invalid {}: '{}'", field, value));
            }
        }

        // 5. 依赖声明
        for dep in &manifest.dependencies {
            if !Self::is_valid_module_name(&dep.name) {
                errors.push(format!("invalid dependency name: '{}'", dep.name));
            }
            if !dep.version.is_empty()
                && !DependencyResolver::is_valid_version_requirement(&dep.version)
            {
                errors.push(format!(
                    "invalid version requirement for dependency '{}': '{}'",
                    dep.name, dep.version
                ));
            }
        }

        // 6. 入口符号
        for symbol in [
            &manifest.entry_points.init,
            &manifest.entry_points.start,
            &manifest.entry_points.stop,
            &manifest.entry_points.destroy,
        ] {
            if !Self::is_valid_symbol_name(symbol) {
                errors.push(format!("invalid entry point symbol: '{}'", symbol));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HelixError::ManifestInvalid(errors.join("; ")))
        }
    }

    /// 判断一段 JSON 是否为合法清单（供外部工具使用）
    pub fn is_valid(content: &[u8]) -> bool {
        Self::parse_bytes(content).is_ok()
    }

    /// 将清单序列化回 JSON
    ///
    /// 输出是确定性的：字段顺序固定，`config` 使用有序映射。
    pub fn serialize_manifest(manifest: &ModuleManifest) -> Result<String> {
        Ok(serde_json::to_string_pretty(manifest)?)
    }

    /// 检查模块名格式
    ///
    /// 合法格式：字母开头，仅含字母、数字、下划线、连字符，长度 1..=64。
    pub fn is_valid_module_name(name: &str) -> bool {
        if name.is_empty() || name.len() > MAX_MODULE_NAME_LEN {
            return false;
        }

        let mut chars = name.chars();
        let first = chars.next().unwrap();
        if !first.is_ascii_alphabetic() {
            return false;
        }

        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    /// 检查入口符号是否为合法 C 标识符
    pub fn is_valid_symbol_name(symbol: &str) -> bool {
        if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN {
            return false;
        }

        let mut chars = symbol.chars();
        let first = chars.next().unwrap();
        if !first.is_ascii_alphabetic() && first != '_' {
            return false;
        }

        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// 检查路径是否为不逃逸安装目录的相对路径
    fn is_confined_relative_path(path: &str) -> bool {
        let path = Path::new(path);
        if path.is_absolute() {
            return false;
        }
        path.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    }
}
