//! 会话管理错误类型
//!
//! 同步调用（创建、清理、查询）通过 `SessionResult` 返回错误；
//! 异步完成结果只通过委托回调或缓存记录投递，不会出现在这里。

use std::path::PathBuf;

use thiserror::Error;

use crate::cache::TaskKey;
use crate::transport::TransportError;

/// 后台传输会话错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 在 one_time_setup 之前调用了后台任务创建接口
    #[error("后台会话尚未初始化")]
    NotConfigured,

    /// 重复初始化（宿主应用与扩展的初始化入口互斥）
    #[error("后台会话已初始化: session_id={0}")]
    AlreadyConfigured(String),

    /// 缓存中没有该 (user_id, associate_id) 的记录
    #[error("未找到任务缓存: {0}")]
    NotFound(TaskKey),

    /// 该键对应的任务已完成，需要通过 session_task_completed_cached_info 读取结果
    #[error("任务已完成: {0}")]
    AlreadyCompleted(TaskKey),

    /// 持久化写入失败
    #[error("缓存读写失败: {0}")]
    Io(#[from] std::io::Error),

    /// 缓存记录无法解密或解析（在缓存内部自愈为 NotFound）
    #[error("缓存记录已损坏 {path:?}: {reason}")]
    CacheCorrupted { path: PathBuf, reason: String },

    /// 传输层错误，保留原始错误供调用方检查
    #[error("传输层错误: {0}")]
    Transport(#[from] TransportError),

    /// cancel_and_clean_up 中部分任务取消或清理失败
    #[error("{} 个任务取消失败", failed.len())]
    CancellationPartialFailure { failed: Vec<TaskKey> },

    /// 参数无效
    #[error("参数无效: {0}")]
    InvalidArgument(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_transport_error_is_inspectable() {
        let err: SessionError = TransportError::Other("connection reset".to_string()).into();
        let source = err.source().expect("transport error should be kept as source");
        assert_eq!(source.to_string(), "connection reset");
    }

    #[test]
    fn test_partial_failure_message() {
        let err = SessionError::CancellationPartialFailure {
            failed: vec![TaskKey::new("u1", "a1"), TaskKey::new("u1", "a2")],
        };
        assert_eq!(err.to_string(), "2 个任务取消失败");
    }
}
