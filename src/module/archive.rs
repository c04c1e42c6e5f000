//! `.helx` 包解压器
//!
//! `.helx` 是 gzip 压缩的 tar 归档，顶层恰好包含 `manifest.json`
//! 与一个动态库文件。本模块将其流式解压到模块根目录下的
//! 临时目录中，不调用任何外部 shell。
//!
//! 解压目标目录名形如 `.tmp_install_<pid>_<seq>`：进程号加进程内
//! 递增序号，保证同进程内连续安装互不冲突。

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::utils::{HelixError, Result};

/// 临时解压目录前缀
const TMP_INSTALL_PREFIX: &str = ".tmp_install_";

/// 进程内安装序号
static INSTALL_SEQ: AtomicU64 = AtomicU64::new(0);

/// 将 `.helx` 包解压到模块根目录下的唯一临时目录
///
/// # Arguments
///
/// * `package_path` - `.helx` 文件路径
/// * `modules_root` - 模块根目录（临时目录建在其下）
///
/// # Returns
///
/// 解压完成的临时目录路径。调用方负责把内容移入最终安装目录并
/// 清理临时目录。
///
/// # Errors
///
/// 归档不可读、gzip/tar 解码失败、或包含逃逸路径（绝对路径、`..`）
/// 时返回 `ExtractFailed`；失败时临时目录被移除。
pub fn extract_package(package_path: &Path, modules_root: &Path) -> Result<PathBuf> {
    let seq = INSTALL_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp_dir = modules_root.join(format!(
        "{}{}_{}",
        TMP_INSTALL_PREFIX,
        std::process::id(),
        seq
    ));

    std::fs::create_dir_all(&temp_dir)?;

    match extract_into(package_path, &temp_dir) {
        Ok(()) => {
            debug!(package = %package_path.display(), dest = %temp_dir.display(), "包解压完成");
            Ok(temp_dir)
        }
        Err(e) => {
            if let Err(cleanup_err) = std::fs::remove_dir_all(&temp_dir) {
                warn!(dir = %temp_dir.display(), error = %cleanup_err, "清理临时解压目录失败");
            }
            Err(e)
        }
    }
}

/// 流式解压 gzip tar 到目标目录
fn extract_into(package_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(package_path)
        .map_err(|e| HelixError::ExtractFailed(format!("cannot open package: {}", e)))?;

    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| HelixError::ExtractFailed(format!("cannot read archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| HelixError::ExtractFailed(format!("corrupt archive entry: {}", e)))?;

        let path = entry
            .path()
            .map_err(|e| HelixError::ExtractFailed(format!("bad entry path: {}", e)))?
            .into_owned();

        if !is_safe_entry_path(&path) {
            return Err(HelixError::ExtractFailed(format!(
                "archive entry '{}' escapes the destination",
                path.display()
            )));
        }

        entry
            .unpack_in(dest)
            .map_err(|e| HelixError::ExtractFailed(format!("unpack failed: {}", e)))?;
    }

    Ok(())
}

/// 条目路径必须是不含 `..` 的相对路径
fn is_safe_entry_path(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// 构造一个内存中的 .helx 包并写入磁盘
    fn write_helx(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (entry_name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, entry_name, *content).unwrap();
        }

        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_extract_valid_package() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = br#"{"name": "hello", "version": "1.0.0", "binary_path": "libhello.so"}"#;
        let package = write_helx(
            dir.path(),
            "hello.helx",
            &[("manifest.json", manifest.as_slice()), ("libhello.so", b"ELF")],
        );

        let extracted = extract_package(&package, dir.path()).unwrap();

        assert!(extracted.starts_with(dir.path()));
        assert!(extracted
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(TMP_INSTALL_PREFIX));
        assert!(extracted.join("manifest.json").is_file());
        assert!(extracted.join("libhello.so").is_file());

        std::fs::remove_dir_all(extracted).unwrap();
    }

    #[test]
    fn test_extract_unique_temp_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let package = write_helx(dir.path(), "m.helx", &[("manifest.json", b"{}")]);

        let first = extract_package(&package, dir.path()).unwrap();
        let second = extract_package(&package, dir.path()).unwrap();

        assert_ne!(first, second);
    }

    /// 构造带 `..` 条目的恶意包（绕过 Builder 的路径整形，直接写 header 字段）
    fn write_traversal_helx(dir: &Path) -> PathBuf {
        let path = dir.join("evil.helx");
        let file = std::fs::File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let content: &[u8] = b"gotcha";
        let mut header = tar::Header::new_gnu();
        let name = b"../escape.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, content).unwrap();

        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_extract_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let package = write_traversal_helx(dir.path());

        let result = extract_package(&package, dir.path());
        assert!(matches!(result, Err(HelixError::ExtractFailed(_))));

        // 失败后不留临时目录，也没有逃逸文件
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_INSTALL_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_extract_rejects_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("broken.helx");
        std::fs::write(&package, b"definitely not a gzip stream").unwrap();

        let result = extract_package(&package, dir.path());
        assert!(matches!(result, Err(HelixError::ExtractFailed(_))));
    }

    #[test]
    fn test_extract_missing_package() {
        let dir = tempfile::tempdir().unwrap();

        let result = extract_package(&dir.path().join("nope.helx"), dir.path());
        assert!(matches!(result, Err(HelixError::ExtractFailed(_))));
    }
}
