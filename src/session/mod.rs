//! 后台传输会话
//!
//! - `registry`：会话注册表（一次性初始化、reconnect、前台会话）
//! - `dispatcher`：传输层事件 -> 任务回调 / 缓存
//! - `manager`：对外入口 `TransferSessionManager`

pub mod delegate;
mod dispatcher;
pub mod manager;
pub mod registry;
pub mod task;

pub use delegate::{
    DataTaskCompletion, DataTaskResult, IntermediateDataHandler, IntermediateResponseHandler,
    ProgressHandler, SessionTaskDelegate, TaskOutcome, TransferProgress,
};
pub use manager::{PendingTasks, TransferSessionManager};
pub use registry::{SessionIdentity, SetupContext};
pub use task::{TaskState, TransferTask};
