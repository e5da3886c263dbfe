//! 回环传输实现
//!
//! 模拟"进程外"的系统传输守护进程：多个管理器实例克隆同一个 `MemoryTransport`，
//! 就如同宿主应用与扩展共享系统后台会话。任务不会自己运行，由调用方通过
//! `deliver_*` / `complete_*` 方法驱动事件。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::hub::SessionHub;
use super::{
    EventSink, TaskId, TransferRequest, Transport, TransportCompletion, TransportError,
    TransportEvent, TransportEventKind, TransportTaskInfo, TransportTaskState,
};
use crate::cache::{ResponseMetadata, TaskErrorInfo, TaskKind};

/// 回环任务快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTask {
    pub kind: TaskKind,
    pub state: TransportTaskState,
    pub request: Option<TransferRequest>,
    pub source: Option<PathBuf>,
    pub resume_data: Option<Vec<u8>>,
}

struct MemoryInner {
    hub: SessionHub,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<(String, TaskId), MemoryTask>>,
    /// 注入的取消失败
    failing_cancels: Mutex<Vec<(String, TaskId)>>,
    work_dir: PathBuf,
}

/// 回环传输
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("work_dir", &self.inner.work_dir)
            .field("tasks", &self.inner.tasks.lock().len())
            .finish()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("cloud-transfer-session-memory"))
    }
}

impl MemoryTransport {
    /// `work_dir` 用于存放模拟下载完成时的临时文件
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                hub: SessionHub::default(),
                next_id: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                failing_cancels: Mutex::new(Vec::new()),
                work_dir: work_dir.into(),
            }),
        }
    }

    fn insert_task(&self, session_id: &str, task: MemoryTask) -> TaskId {
        let task_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(
            "回环传输创建任务: session={}, task_id={}, kind={}",
            session_id, task_id, task.kind
        );
        self.inner
            .tasks
            .lock()
            .insert((session_id.to_string(), task_id), task);
        task_id
    }

    fn with_live_task<R>(
        &self,
        session_id: &str,
        task_id: TaskId,
        f: impl FnOnce(&mut MemoryTask) -> R,
    ) -> Result<R, TransportError> {
        let mut tasks = self.inner.tasks.lock();
        match tasks.get_mut(&(session_id.to_string(), task_id)) {
            Some(task) if task.state != TransportTaskState::Completed => Ok(f(task)),
            _ => Err(TransportError::task_not_found(session_id, task_id)),
        }
    }

    // ========================================================================
    // 观察与驱动
    // ========================================================================

    /// 任务快照（包括已结束的任务）
    pub fn task(&self, session_id: &str, task_id: TaskId) -> Option<MemoryTask> {
        self.inner
            .tasks
            .lock()
            .get(&(session_id.to_string(), task_id))
            .cloned()
    }

    /// 会话中创建过的任务数
    pub fn task_count(&self, session_id: &str) -> usize {
        self.inner
            .tasks
            .lock()
            .keys()
            .filter(|(session, _)| session == session_id)
            .count()
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.inner.hub.is_attached(session_id)
    }

    /// 暂存中的完成事件数
    pub fn pending_completions(&self, session_id: &str) -> usize {
        self.inner.hub.backlog_len(session_id)
    }

    /// 模拟传输层丢失任务（例如系统重启后后台会话被清空）
    pub fn forget_task(&self, session_id: &str, task_id: TaskId) {
        self.inner
            .tasks
            .lock()
            .remove(&(session_id.to_string(), task_id));
    }

    /// 让下一次对该任务的取消请求失败
    pub fn fail_next_cancel(&self, session_id: &str, task_id: TaskId) {
        self.inner
            .failing_cancels
            .lock()
            .push((session_id.to_string(), task_id));
    }

    pub fn deliver_response(&self, session_id: &str, task_id: TaskId, response: ResponseMetadata) {
        self.emit(session_id, task_id, TransportEventKind::Response(response));
    }

    pub fn deliver_data(&self, session_id: &str, task_id: TaskId, data: &[u8]) {
        self.emit(session_id, task_id, TransportEventKind::Data(data.to_vec()));
    }

    pub fn deliver_progress(
        &self,
        session_id: &str,
        task_id: TaskId,
        bytes_transferred: u64,
        bytes_expected: Option<u64>,
    ) {
        self.emit(
            session_id,
            task_id,
            TransportEventKind::Progress {
                bytes_transferred,
                bytes_expected,
            },
        );
    }

    /// 结束任务并投递完成事件
    pub fn deliver_completion(
        &self,
        session_id: &str,
        task_id: TaskId,
        completion: TransportCompletion,
    ) {
        if let Some(task) = self
            .inner
            .tasks
            .lock()
            .get_mut(&(session_id.to_string(), task_id))
        {
            task.state = TransportTaskState::Completed;
        }
        self.emit(session_id, task_id, TransportEventKind::Completed(completion));
    }

    /// 模拟下载完成：载荷写入临时文件后投递完成事件
    pub fn complete_download(
        &self,
        session_id: &str,
        task_id: TaskId,
        status: u16,
        payload: &[u8],
    ) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.inner.work_dir)?;
        let location = self
            .inner
            .work_dir
            .join(format!("download-{}.tmp", Uuid::new_v4()));
        std::fs::write(&location, payload)?;

        let mut response = ResponseMetadata::with_status(status);
        response.expected_content_length = Some(payload.len() as u64);

        self.deliver_completion(
            session_id,
            task_id,
            TransportCompletion {
                response: Some(response),
                location: Some(location.clone()),
                ..Default::default()
            },
        );
        Ok(location)
    }

    /// 模拟上传/数据任务完成，响应体随完成事件投递
    pub fn complete_with_payload(
        &self,
        session_id: &str,
        task_id: TaskId,
        status: u16,
        payload: &[u8],
    ) {
        self.deliver_completion(
            session_id,
            task_id,
            TransportCompletion {
                response: Some(ResponseMetadata::with_status(status)),
                data: Some(payload.to_vec()),
                ..Default::default()
            },
        );
    }

    /// 模拟网络失败，可附带断点数据
    pub fn fail_task(
        &self,
        session_id: &str,
        task_id: TaskId,
        message: &str,
        resume_data: Option<Vec<u8>>,
    ) {
        self.deliver_completion(
            session_id,
            task_id,
            TransportCompletion {
                error: Some(TaskErrorInfo::transport(message)),
                resume_data,
                ..Default::default()
            },
        );
    }

    fn emit(&self, session_id: &str, task_id: TaskId, kind: TransportEventKind) {
        self.inner.hub.emit(TransportEvent {
            session_id: session_id.to_string(),
            task_id,
            kind,
        });
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn attach(&self, session_id: &str, sink: EventSink) -> Result<(), TransportError> {
        self.inner.hub.attach(session_id, sink);
        Ok(())
    }

    async fn detach(&self, session_id: &str) {
        self.inner.hub.detach(session_id);
    }

    async fn create_download_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
    ) -> Result<TaskId, TransportError> {
        Ok(self.insert_task(
            session_id,
            MemoryTask {
                kind: TaskKind::Download,
                state: TransportTaskState::Suspended,
                request: Some(request.clone()),
                source: None,
                resume_data: None,
            },
        ))
    }

    async fn create_download_task_with_resume_data(
        &self,
        session_id: &str,
        resume_data: &[u8],
    ) -> Result<TaskId, TransportError> {
        if resume_data.is_empty() {
            return Err(TransportError::InvalidResumeData("断点数据为空".to_string()));
        }

        Ok(self.insert_task(
            session_id,
            MemoryTask {
                kind: TaskKind::Download,
                state: TransportTaskState::Suspended,
                request: None,
                source: None,
                resume_data: Some(resume_data.to_vec()),
            },
        ))
    }

    async fn create_upload_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
        source: &Path,
    ) -> Result<TaskId, TransportError> {
        Ok(self.insert_task(
            session_id,
            MemoryTask {
                kind: TaskKind::Upload,
                state: TransportTaskState::Suspended,
                request: Some(request.clone()),
                source: Some(source.to_path_buf()),
                resume_data: None,
            },
        ))
    }

    async fn create_data_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
    ) -> Result<TaskId, TransportError> {
        Ok(self.insert_task(
            session_id,
            MemoryTask {
                kind: TaskKind::Data,
                state: TransportTaskState::Suspended,
                request: Some(request.clone()),
                source: None,
                resume_data: None,
            },
        ))
    }

    async fn resume_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError> {
        self.with_live_task(session_id, task_id, |task| {
            task.state = TransportTaskState::Running;
        })
    }

    async fn suspend_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError> {
        self.with_live_task(session_id, task_id, |task| {
            task.state = TransportTaskState::Suspended;
        })
    }

    async fn cancel_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError> {
        let key = (session_id.to_string(), task_id);
        {
            let mut failing = self.inner.failing_cancels.lock();
            if let Some(pos) = failing.iter().position(|k| *k == key) {
                failing.remove(pos);
                return Err(TransportError::Other(format!(
                    "取消任务失败: session={}, task={}",
                    session_id, task_id
                )));
            }
        }

        let resume_data = self.with_live_task(session_id, task_id, |task| {
            task.state = TransportTaskState::Completed;
            (task.kind == TaskKind::Download).then(|| format!("memory-resume:{}", task_id).into_bytes())
        })?;

        self.emit(
            session_id,
            task_id,
            TransportEventKind::Completed(TransportCompletion {
                error: Some(TaskErrorInfo::cancelled()),
                resume_data,
                ..Default::default()
            }),
        );
        Ok(())
    }

    async fn tasks(&self, session_id: &str) -> Result<Vec<TransportTaskInfo>, TransportError> {
        let tasks = self.inner.tasks.lock();
        let mut infos: Vec<TransportTaskInfo> = tasks
            .iter()
            .filter(|((session, _), task)| {
                session == session_id && task.state != TransportTaskState::Completed
            })
            .map(|((_, task_id), task)| TransportTaskInfo {
                task_id: *task_id,
                kind: task.kind,
                state: task.state,
            })
            .collect();
        infos.sort_by_key(|info| info.task_id);
        Ok(infos)
    }
}
