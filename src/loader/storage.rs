//! 磁盘空间预检

use crate::loader::LoaderError;
use std::path::Path;
use sysinfo::Disks;
use tracing::{debug, warn};

/// 目标路径所在卷的可用空间
///
/// 取挂载点最长匹配的磁盘；无法判断时返回 None
pub fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// 检查写入 `needed` 字节后仍保留 `reserve` 字节
///
/// 无法获取磁盘信息时放行，写入时的 ENOSPC 仍会被识别
pub fn ensure_free_space(path: &Path, needed: u64, reserve: u64) -> Result<(), LoaderError> {
    let Some(available) = available_space(path) else {
        warn!("无法获取磁盘信息，跳过空间预检: {:?}", path);
        return Ok(());
    };

    let required = needed.saturating_add(reserve);
    debug!(
        "空间预检: path={:?}, 需要={} bytes, 可用={} bytes",
        path, required, available
    );
    check(required, available)
}

fn check(required: u64, available: u64) -> Result<(), LoaderError> {
    if required > available {
        return Err(LoaderError::InsufficientStorage {
            needed: required,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check() {
        assert!(check(10, 100).is_ok());
        assert!(check(100, 100).is_ok());
        match check(101, 100) {
            Err(LoaderError::InsufficientStorage { needed, available }) => {
                assert_eq!(needed, 101);
                assert_eq!(available, 100);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_small_file_fits_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_free_space(dir.path(), 1, 0).is_ok());
    }
}
