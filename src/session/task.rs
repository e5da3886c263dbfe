//! 传输任务句柄

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{TaskKey, TaskKind};
use crate::error::SessionResult;
use crate::transport::{TaskId, Transport, TransportError, TransportTaskState};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// 已创建，尚未开始
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl From<TransportTaskState> for TaskState {
    fn from(state: TransportTaskState) -> Self {
        match state {
            TransportTaskState::Suspended => TaskState::Suspended,
            TransportTaskState::Running => TaskState::Running,
            // 取消中的任务对调用方仍然是运行状态，结果以完成事件为准
            TransportTaskState::Canceling => TaskState::Running,
            TransportTaskState::Completed => TaskState::Completed,
        }
    }
}

struct TaskInner {
    kind: TaskKind,
    session_id: String,
    task_id: TaskId,
    key: Option<TaskKey>,
    path: Option<PathBuf>,
    state: Mutex<TaskState>,
    transport: Arc<dyn Transport>,
}

/// 一个上传/下载/数据任务的内存句柄
///
/// 克隆开销很小，所有克隆共享同一份状态
#[derive(Clone)]
pub struct TransferTask {
    inner: Arc<TaskInner>,
}

impl TransferTask {
    pub(crate) fn new(
        kind: TaskKind,
        session_id: impl Into<String>,
        task_id: TaskId,
        key: Option<TaskKey>,
        path: Option<PathBuf>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                kind,
                session_id: session_id.into(),
                task_id,
                key,
                path,
                state: Mutex::new(TaskState::Pending),
                transport,
            }),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// 传输层任务 ID
    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    /// 后台任务的 (user_id, associate_id)，前台任务没有
    pub fn key(&self) -> Option<&TaskKey> {
        self.inner.key.as_ref()
    }

    /// 下载目标路径或上传源文件
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.lock()
    }

    /// 开始或继续传输
    pub async fn resume(&self) -> SessionResult<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.inner
            .transport
            .resume_task(&self.inner.session_id, self.inner.task_id)
            .await?;
        self.set_state(TaskState::Running);
        debug!("任务已启动: {:?}", self);
        Ok(())
    }

    /// 挂起传输
    pub async fn suspend(&self) -> SessionResult<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.inner
            .transport
            .suspend_task(&self.inner.session_id, self.inner.task_id)
            .await?;
        self.set_state(TaskState::Suspended);
        Ok(())
    }

    /// 请求取消，最终状态由完成事件给出
    ///
    /// 已结束的任务视为取消成功
    pub async fn cancel(&self) -> SessionResult<()> {
        match self
            .inner
            .transport
            .cancel_task(&self.inner.session_id, self.inner.task_id)
            .await
        {
            Ok(()) | Err(TransportError::TaskNotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 终止状态不再改变
    pub(crate) fn set_state(&self, state: TaskState) {
        let mut current = self.inner.state.lock();
        if !current.is_terminal() {
            *current = state;
        }
    }
}

impl PartialEq for TransferTask {
    fn eq(&self, other: &Self) -> bool {
        self.inner.session_id == other.inner.session_id && self.inner.task_id == other.inner.task_id
    }
}

impl Eq for TransferTask {}

impl std::fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTask")
            .field("kind", &self.inner.kind)
            .field("session_id", &self.inner.session_id)
            .field("task_id", &self.inner.task_id)
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .finish()
    }
}
