//! 任务回调
//!
//! `SessionTaskDelegate` 只要求实现完成回调；中间响应、中间数据、进度三类回调是可选能力，
//! 通过 `as_*` 方法声明，分发时逐个事件检查，未声明的事件直接丢弃。

use parking_lot::Mutex;

use super::task::TransferTask;
use crate::cache::{CachedTaskInfo, ResponseMetadata, ResultLocation, TaskErrorInfo};

/// 进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// 下载为已写入字节，上传为已发送字节
    pub bytes_transferred: u64,
    pub bytes_expected: Option<u64>,
}

impl TransferProgress {
    /// 完成比例，总大小未知时为 None
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_expected {
            Some(0) | None => None,
            Some(expected) => Some(self.bytes_transferred as f64 / expected as f64),
        }
    }
}

/// 任务结束时交给回调的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    pub response: Option<ResponseMetadata>,
    /// 上传/数据任务的响应体
    pub data: Option<Vec<u8>>,
    pub result: Option<ResultLocation>,
    pub error: Option<TaskErrorInfo>,
    pub resume_data: Option<Vec<u8>>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.response.as_ref().map_or(false, |r| r.is_success())
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().map_or(false, TaskErrorInfo::is_cancelled)
    }
}

impl From<&CachedTaskInfo> for TaskOutcome {
    fn from(info: &CachedTaskInfo) -> Self {
        let data = match &info.result {
            Some(ResultLocation::Payload { data }) => Some(data.clone()),
            _ => None,
        };
        Self {
            response: info.response.clone(),
            data,
            result: info.result.clone(),
            error: info.error.clone(),
            resume_data: info.resume_data.clone(),
        }
    }
}

/// 任务回调（必选部分）
pub trait SessionTaskDelegate: Send + Sync {
    /// 任务结束：成功、失败或被取消
    fn session_task_did_finish(&self, task: &TransferTask, outcome: &TaskOutcome);

    fn as_response_handler(&self) -> Option<&dyn IntermediateResponseHandler> {
        None
    }

    fn as_data_handler(&self) -> Option<&dyn IntermediateDataHandler> {
        None
    }

    fn as_progress_handler(&self) -> Option<&dyn ProgressHandler> {
        None
    }
}

/// 可选：响应头到达
pub trait IntermediateResponseHandler: Send + Sync {
    fn session_task_did_receive_response(&self, task: &TransferTask, response: &ResponseMetadata);
}

/// 可选：收到中间数据
pub trait IntermediateDataHandler: Send + Sync {
    fn session_task_did_receive_data(&self, task: &TransferTask, data: &[u8]);
}

/// 可选：进度
pub trait ProgressHandler: Send + Sync {
    fn session_task_did_report_progress(&self, task: &TransferTask, progress: TransferProgress);
}

/// 数据任务的结果：(响应, 响应体) 或错误
pub type DataTaskResult = Result<(ResponseMetadata, Vec<u8>), TaskErrorInfo>;

/// 数据任务完成闭包
pub type DataTaskCompletion = Box<dyn FnOnce(DataTaskResult) + Send + 'static>;

/// 把完成闭包包装成回调，只触发一次
pub(crate) struct CompletionDelegate {
    completion: Mutex<Option<DataTaskCompletion>>,
}

impl CompletionDelegate {
    pub(crate) fn new(completion: DataTaskCompletion) -> Self {
        Self {
            completion: Mutex::new(Some(completion)),
        }
    }
}

impl SessionTaskDelegate for CompletionDelegate {
    fn session_task_did_finish(&self, _task: &TransferTask, outcome: &TaskOutcome) {
        let Some(completion) = self.completion.lock().take() else {
            return;
        };

        let result = match (&outcome.error, &outcome.response) {
            (Some(error), _) => Err(error.clone()),
            (None, Some(response)) => Ok((response.clone(), outcome.data.clone().unwrap_or_default())),
            (None, None) => Err(TaskErrorInfo::transport("任务结束但没有响应")),
        };
        completion(result);
    }
}
