//! 缓存文件操作
//!
//! ## 文件结构
//!
//! ```text
//! {root_cache_dir}/
//! ├── records/{hex(user_id)}/{hex(associate_id)}.meta   # 任务记录
//! └── index/{hex(session_id)}/{task_id}.key             # 传输层任务 ID -> 任务键
//! ```
//!
//! 文件内容均为加密后的 JSON；写入时先写临时文件再原子重命名。

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::TaskKey;
use crate::transport::TaskId;

/// 记录文件扩展名
const RECORD_EXTENSION: &str = "meta";

/// 索引文件扩展名
const INDEX_EXTENSION: &str = "key";

const RECORDS_DIR: &str = "records";

const INDEX_DIR: &str = "index";

/// 用户记录目录
pub fn user_dir(root: &Path, user_id: &str) -> PathBuf {
    root.join(RECORDS_DIR).join(hex::encode(user_id))
}

/// 任务记录文件路径
pub fn record_path(root: &Path, key: &TaskKey) -> PathBuf {
    user_dir(root, &key.user_id).join(format!(
        "{}.{}",
        hex::encode(&key.associate_id),
        RECORD_EXTENSION
    ))
}

/// 反查索引文件路径
pub fn index_path(root: &Path, session_id: &str, task_id: TaskId) -> PathBuf {
    root.join(INDEX_DIR)
        .join(hex::encode(session_id))
        .join(format!("{}.{}", task_id, INDEX_EXTENSION))
}

/// 确保目录存在
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("已创建目录: {:?}", dir);
    }
    Ok(())
}

/// 原子写入文件
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)
}

/// 读取文件，不存在时返回 None
pub fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// 删除文件，不存在视为成功；返回是否实际删除
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// 列出用户目录下的所有记录文件
pub fn list_record_files(root: &Path, user_id: &str) -> io::Result<Vec<PathBuf>> {
    let dir = user_dir(root, user_id);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
        })
        .collect();
    files.sort();

    Ok(files)
}
