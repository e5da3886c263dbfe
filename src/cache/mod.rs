//! 任务缓存模块
//!
//! 以 (user_id, associate_id) 为键持久化后台任务元数据，跨进程重启存活：
//! - 任务注册时立即写入记录，进程崩溃后仍可发现
//! - 完成事件无人接收时写入完成记录，调用方稍后查询
//! - 落盘内容经宿主提供的 `CacheCipher` 加密

pub mod manager;
pub mod store;
pub mod types;

pub use manager::{PendingEntry, TaskCache};
pub use types::{
    CachedTaskInfo, ResponseMetadata, ResultLocation, TaskErrorInfo, TaskErrorKind, TaskIndexEntry,
    TaskKey, TaskKind,
};
