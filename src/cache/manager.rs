//! 任务缓存
//!
//! 负责：
//! - (user_id, associate_id) -> `CachedTaskInfo` 的持久化
//! - 传输层任务 ID -> 任务键的反查索引
//! - 与传输层存活任务交叉比对，列出待完成任务
//!
//! ## 并发约定
//!
//! 同一进程内所有指向同一 `root_cache_dir` 的 `TaskCache` 共享一把异步互斥锁（作用域锁）。
//! `lookup`/`store`/`delete` 等方法本身不加锁，调用方在"检查-创建"或"完成-落盘"
//! 这类复合操作期间持有 `lock()` 返回的守卫。
//!
//! 作用域锁只在进程内有效。宿主应用与扩展共用同一缓存目录时，单个文件的写入由临时文件
//! 加重命名保证原子性，但跨进程的"检查-创建"不互斥：两个进程同时为同一个键创建任务时，
//! 后写入的记录生效，先创建的传输层任务在完成时找不到记录，其下载文件被当作孤立文件删除。

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::store::{self, index_path, record_path};
use super::types::{CachedTaskInfo, TaskIndexEntry, TaskKey, TaskKind};
use crate::cipher::CacheCipher;
use crate::error::{SessionError, SessionResult};
use crate::transport::{TaskId, TransportTaskInfo, TransportTaskState};

/// 进程内按缓存根目录划分的作用域锁
static SCOPE_LOCKS: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();

fn scope_lock_for(root_dir: &Path) -> Arc<Mutex<()>> {
    let canonical = std::fs::canonicalize(root_dir).unwrap_or_else(|_| root_dir.to_path_buf());
    SCOPE_LOCKS
        .get_or_init(DashMap::new)
        .entry(canonical)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// 传输层存活任务与缓存记录的比对结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub session_id: String,
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub state: TransportTaskState,
    /// 缓存中能找到记录时才有
    pub key: Option<TaskKey>,
    pub path: Option<PathBuf>,
}

/// 任务缓存
pub struct TaskCache {
    root_dir: PathBuf,
    cipher: Arc<dyn CacheCipher>,
    scope: Arc<Mutex<()>>,
}

impl std::fmt::Debug for TaskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCache")
            .field("root_dir", &self.root_dir)
            .finish_non_exhaustive()
    }
}

impl TaskCache {
    /// 打开缓存目录（不存在时创建）
    pub fn open(root_dir: impl Into<PathBuf>, cipher: Arc<dyn CacheCipher>) -> SessionResult<Self> {
        let root_dir = root_dir.into();
        store::ensure_dir(&root_dir)?;

        let scope = scope_lock_for(&root_dir);
        info!("任务缓存已打开: {:?}", root_dir);

        Ok(Self {
            root_dir,
            cipher,
            scope,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// 获取作用域锁
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.scope.lock().await
    }

    // ========================================================================
    // 记录读写
    // ========================================================================

    /// 查询记录
    ///
    /// 解密或解析失败的记录会被删除并视为不存在
    pub fn lookup(&self, key: &TaskKey) -> Option<CachedTaskInfo> {
        let path = record_path(&self.root_dir, key);
        match self.read_sealed::<CachedTaskInfo>(&path) {
            Ok(Some(info)) if info.key() == *key => Some(info),
            Ok(Some(info)) => {
                self.discard_corrupted(
                    &path,
                    &format!("记录键不匹配: 期望 {}, 实际 {}", key, info.key()),
                );
                None
            }
            Ok(None) => None,
            Err(SessionError::CacheCorrupted { path, reason }) => {
                self.discard_corrupted(&path, &reason);
                None
            }
            Err(e) => {
                warn!("读取任务缓存失败 {}: {}", key, e);
                None
            }
        }
    }

    /// 写入记录及其反查索引
    pub fn store(&self, info: &CachedTaskInfo) -> SessionResult<()> {
        let key = info.key();
        key.validate()?;

        self.write_sealed(&record_path(&self.root_dir, &key), info)?;

        let entry = TaskIndexEntry {
            session_id: info.session_id.clone(),
            task_id: info.task_id,
            key: key.clone(),
        };
        self.write_sealed(
            &index_path(&self.root_dir, &info.session_id, info.task_id),
            &entry,
        )?;

        debug!(
            "已保存任务缓存: key={}, task_id={}, completed={}",
            key, info.task_id, info.completed
        );
        Ok(())
    }

    /// 删除记录，返回记录是否存在
    pub fn delete(&self, key: &TaskKey) -> SessionResult<bool> {
        if let Some(info) = self.lookup(key) {
            self.delete_index(&info.session_id, info.task_id)?;
        }

        let removed = store::remove_if_exists(&record_path(&self.root_dir, key))?;
        if removed {
            debug!("已删除任务缓存: key={}", key);
        }
        Ok(removed)
    }

    /// 删除反查索引（任务重建时旧索引失效）
    pub fn delete_index(&self, session_id: &str, task_id: TaskId) -> SessionResult<()> {
        store::remove_if_exists(&index_path(&self.root_dir, session_id, task_id))?;
        Ok(())
    }

    /// 根据传输层任务 ID 反查任务键
    pub fn key_for_task(&self, session_id: &str, task_id: TaskId) -> Option<TaskKey> {
        let path = index_path(&self.root_dir, session_id, task_id);
        match self.read_sealed::<TaskIndexEntry>(&path) {
            Ok(Some(entry)) if entry.session_id == session_id && entry.task_id == task_id => {
                Some(entry.key)
            }
            Ok(Some(_)) => {
                self.discard_corrupted(&path, "索引内容与文件名不一致");
                None
            }
            Ok(None) => None,
            Err(SessionError::CacheCorrupted { path, reason }) => {
                self.discard_corrupted(&path, &reason);
                None
            }
            Err(e) => {
                warn!("读取任务索引失败 task_id={}: {}", task_id, e);
                None
            }
        }
    }

    /// 列出某个用户的全部记录
    pub fn list_for_user(&self, user_id: &str) -> Vec<CachedTaskInfo> {
        let files = match store::list_record_files(&self.root_dir, user_id) {
            Ok(files) => files,
            Err(e) => {
                warn!("扫描用户缓存目录失败 user_id={}: {}", user_id, e);
                return Vec::new();
            }
        };

        files
            .iter()
            .filter_map(|path| match self.read_sealed::<CachedTaskInfo>(path) {
                Ok(Some(info)) if info.user_id == user_id => Some(info),
                Ok(_) => None,
                Err(SessionError::CacheCorrupted { path, reason }) => {
                    self.discard_corrupted(&path, &reason);
                    None
                }
                Err(e) => {
                    warn!("读取任务缓存失败 {:?}: {}", path, e);
                    None
                }
            })
            .collect()
    }

    /// 将传输层存活任务与缓存记录交叉比对，按 (上传, 下载) 返回
    ///
    /// 数据任务不属于后台传输，直接忽略
    pub fn list_pending(
        &self,
        session_id: &str,
        live_tasks: &[TransportTaskInfo],
    ) -> (Vec<PendingEntry>, Vec<PendingEntry>) {
        let mut uploads = Vec::new();
        let mut downloads = Vec::new();

        for task in live_tasks {
            if task.state == TransportTaskState::Completed {
                continue;
            }

            let record = self
                .key_for_task(session_id, task.task_id)
                .and_then(|key| self.lookup(&key))
                .filter(|info| info.session_id == session_id && info.task_id == task.task_id);

            let entry = PendingEntry {
                session_id: session_id.to_string(),
                task_id: task.task_id,
                kind: task.kind,
                state: task.state,
                key: record.as_ref().map(CachedTaskInfo::key),
                path: record.and_then(|info| info.path),
            };

            match task.kind {
                TaskKind::Upload => uploads.push(entry),
                TaskKind::Download => downloads.push(entry),
                TaskKind::Data => {}
            }
        }

        (uploads, downloads)
    }

    // ========================================================================
    // 加密读写
    // ========================================================================

    fn write_sealed<T: serde::Serialize>(&self, path: &Path, value: &T) -> SessionResult<()> {
        let plaintext = serde_json::to_vec(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let sealed = self
            .cipher
            .encrypt(&plaintext)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        store::write_atomic(path, &sealed)?;
        Ok(())
    }

    fn read_sealed<T: serde::de::DeserializeOwned>(&self, path: &Path) -> SessionResult<Option<T>> {
        let Some(sealed) = store::read_if_exists(path)? else {
            return Ok(None);
        };

        let corrupted = |reason: String| SessionError::CacheCorrupted {
            path: path.to_path_buf(),
            reason,
        };

        let plaintext = self
            .cipher
            .decrypt(&sealed)
            .map_err(|e| corrupted(e.to_string()))?;
        let value = serde_json::from_slice(&plaintext).map_err(|e| corrupted(e.to_string()))?;

        Ok(Some(value))
    }

    fn discard_corrupted(&self, path: &Path, reason: &str) {
        warn!("任务缓存已损坏，已丢弃 {:?}: {}", path, reason);
        if let Err(e) = store::remove_if_exists(path) {
            warn!("删除损坏的缓存文件失败 {:?}: {}", path, e);
        }
    }
}
