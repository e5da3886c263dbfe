// Cloud Transfer Session Library
// 云存储 SDK 后台传输会话管理

// 错误类型
pub mod error;

// 配置管理模块
pub mod config;

// 日志
pub mod logging;

// 缓存加密
pub mod cipher;

// 任务缓存
pub mod cache;

// 传输层接口与实现
pub mod transport;

// 会话管理
pub mod session;

// 导出常用类型
pub use cache::{
    CachedTaskInfo, ResponseMetadata, ResultLocation, TaskErrorInfo, TaskKey, TaskKind,
};
pub use cipher::{AesGcmCipher, CacheCipher, PlainCipher};
pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use session::{
    PendingTasks, SessionIdentity, SessionTaskDelegate, TaskOutcome, TaskState,
    TransferSessionManager, TransferTask,
};
pub use transport::{HttpTransport, MemoryTransport, TransferRequest, Transport, TransportError};
