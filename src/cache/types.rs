//! 任务缓存核心类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{SessionError, SessionResult};
use crate::transport::TaskId;

/// 调用方可见的任务标识 (user_id, associate_id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub user_id: String,
    pub associate_id: String,
}

impl TaskKey {
    pub fn new(user_id: impl Into<String>, associate_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            associate_id: associate_id.into(),
        }
    }

    /// 两个字段都不能为空
    pub fn validate(&self) -> SessionResult<()> {
        if self.user_id.is_empty() {
            return Err(SessionError::InvalidArgument("user_id 不能为空".to_string()));
        }
        if self.associate_id.is_empty() {
            return Err(SessionError::InvalidArgument(
                "associate_id 不能为空".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.associate_id)
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Download,
    Upload,
    /// 前台数据任务（不落盘）
    Data,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Download => "download",
            TaskKind::Upload => "upload",
            TaskKind::Data => "data",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 响应元数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// HTTP 状态码
    pub status: u16,
    /// 最终 URL（跟随重定向后）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_content_length: Option<u64>,
}

impl ResponseMetadata {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 任务错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// 网络/传输失败
    Transport,
    /// 被取消
    Cancelled,
    /// 本地文件操作失败（如移动下载文件）
    Io,
}

/// 可持久化的任务错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    pub kind: TaskErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl TaskErrorInfo {
    /// 取消错误码（与常见平台传输层的 cancelled 错误码一致）
    pub const CANCELLED_CODE: i64 = -999;

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Transport,
            message: message.into(),
            code: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: TaskErrorKind::Cancelled,
            message: "cancelled".to_string(),
            code: Some(Self::CANCELLED_CODE),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Io,
            message: message.into(),
            code: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TaskErrorKind::Cancelled
    }
}

impl fmt::Display for TaskErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{:?}({}): {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// 任务结果位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultLocation {
    /// 下载结果已移动到的目标文件
    File { path: PathBuf },
    /// 缓冲的响应体（上传/数据任务）
    Payload {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

/// 任务缓存记录
///
/// 以 (user_id, associate_id) 为键持久化，completed 置位后直到显式清理前不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTaskInfo {
    pub user_id: String,
    pub associate_id: String,
    pub task_kind: TaskKind,
    /// 任务所属的后台会话
    pub session_id: String,
    /// 传输层任务 ID
    pub task_id: TaskId,
    /// 下载目标路径或上传源文件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultLocation>,
    /// 下载失败时传输层给出的断点数据（不透明）
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub resume_data: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CachedTaskInfo {
    /// 新建未完成记录
    pub fn new_pending(
        key: &TaskKey,
        task_kind: TaskKind,
        session_id: impl Into<String>,
        task_id: TaskId,
        path: Option<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: key.user_id.clone(),
            associate_id: key.associate_id.clone(),
            task_kind,
            session_id: session_id.into(),
            task_id,
            path,
            completed: false,
            response: None,
            error: None,
            result: None,
            resume_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.user_id.clone(), self.associate_id.clone())
    }

    /// 更新时间戳
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 绑定到新的传输层任务（原任务已丢失时重建）
    pub fn rebind(&mut self, session_id: impl Into<String>, task_id: TaskId) {
        self.session_id = session_id.into();
        self.task_id = task_id;
        self.touch();
    }

    /// 写入完成结果
    pub fn mark_completed(
        &mut self,
        response: Option<ResponseMetadata>,
        error: Option<TaskErrorInfo>,
        result: Option<ResultLocation>,
        resume_data: Option<Vec<u8>>,
    ) {
        self.completed = true;
        self.response = response;
        self.error = error;
        self.result = result;
        self.resume_data = resume_data;
        self.touch();
    }

    /// 完成且无错误、状态码为 2xx
    pub fn is_success(&self) -> bool {
        self.completed
            && self.error.is_none()
            && self.response.as_ref().map_or(false, |r| r.is_success())
    }

    /// 完成时的 HTTP 状态码
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }
}

/// 传输层任务 ID 反查索引
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIndexEntry {
    pub session_id: String,
    pub task_id: TaskId,
    pub key: TaskKey,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
