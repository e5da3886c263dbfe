//! 传输层接口
//!
//! 后台会话、任务创建、进度/完成事件、断点数据都由传输层提供，本 crate 只通过
//! `Transport` trait 使用这些能力：
//! - `HttpTransport`：基于 reqwest 的进程内实现
//! - `MemoryTransport`：多个管理器实例共享的回环实现，事件由调用方驱动
//!
//! ## 事件投递约定
//!
//! 每个会话同一时刻最多有一个事件接收端（`attach`）。没有接收端期间产生的完成事件
//! 由传输层暂存，在下一次 `attach` 时按顺序重放；进度类事件直接丢弃。

mod hub;
pub mod http;
pub mod memory;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cache::{ResponseMetadata, TaskErrorInfo, TaskKind};

pub use http::HttpTransport;
pub use memory::{MemoryTask, MemoryTransport};

/// 传输层分配的任务 ID（会话内唯一）
pub type TaskId = u64;

/// 事件接收端
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// 请求描述（由上层 REST 请求对象生成）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl TransferRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// 传输层任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportTaskState {
    Suspended,
    Running,
    Canceling,
    Completed,
}

/// 传输层任务概要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTaskInfo {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub state: TransportTaskState,
}

/// 任务结束时传输层给出的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportCompletion {
    pub response: Option<ResponseMetadata>,
    /// 下载任务：传输层写好的临时文件
    pub location: Option<PathBuf>,
    /// 上传/数据任务：缓冲的响应体
    pub data: Option<Vec<u8>>,
    pub error: Option<TaskErrorInfo>,
    /// 下载中断时的断点数据
    pub resume_data: Option<Vec<u8>>,
}

impl TransportCompletion {
    pub fn success(response: ResponseMetadata) -> Self {
        Self {
            response: Some(response),
            ..Default::default()
        }
    }

    pub fn failure(error: TaskErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// 传输层事件内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// 中间响应（响应头到达）
    Response(ResponseMetadata),
    /// 中间数据
    Data(Vec<u8>),
    /// 进度：下载为已写入字节，上传为已发送字节
    Progress {
        bytes_transferred: u64,
        bytes_expected: Option<u64>,
    },
    /// 任务结束
    Completed(TransportCompletion),
}

/// 传输层事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub session_id: String,
    pub task_id: TaskId,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn is_completion(&self) -> bool {
        matches!(self.kind, TransportEventKind::Completed(_))
    }
}

/// 传输层错误
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("会话未连接: {0}")]
    SessionNotAttached(String),

    #[error("任务不存在: session={session_id}, task={task_id}")]
    TaskNotFound { session_id: String, task_id: TaskId },

    #[error("断点数据无效: {0}")]
    InvalidResumeData(String),

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn task_not_found(session_id: &str, task_id: TaskId) -> Self {
        Self::TaskNotFound {
            session_id: session_id.to_string(),
            task_id,
        }
    }
}

/// 传输层能力
///
/// 创建出的任务处于挂起状态，调用 `resume_task` 后才开始传输
#[async_trait]
pub trait Transport: Send + Sync {
    /// 成为会话的事件接收端（会话不存在时创建），并重放暂存的完成事件
    async fn attach(&self, session_id: &str, sink: EventSink) -> Result<(), TransportError>;

    /// 放弃事件接收端，会话中的任务继续运行
    async fn detach(&self, session_id: &str);

    async fn create_download_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
    ) -> Result<TaskId, TransportError>;

    /// 从断点数据重建下载任务，断点格式由传输层自己定义
    async fn create_download_task_with_resume_data(
        &self,
        session_id: &str,
        resume_data: &[u8],
    ) -> Result<TaskId, TransportError>;

    async fn create_upload_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
        source: &Path,
    ) -> Result<TaskId, TransportError>;

    async fn create_data_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
    ) -> Result<TaskId, TransportError>;

    async fn resume_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError>;

    async fn suspend_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError>;

    /// 取消任务；已结束或不存在的任务返回 `TaskNotFound`
    async fn cancel_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError>;

    /// 会话中尚未结束的任务
    async fn tasks(&self, session_id: &str) -> Result<Vec<TransportTaskInfo>, TransportError>;
}
