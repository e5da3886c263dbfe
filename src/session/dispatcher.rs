//! 回调分发
//!
//! 负责：
//! - 维护存活任务表：(session_id, task_id) -> 任务句柄 + 回调
//! - 把传输层事件转成回调，交给投递队列按顺序执行
//! - 后台任务完成时写入任务缓存（下载文件先移动到记录中的目标路径）
//!
//! 回调从不在作用域锁或存活任务表锁内执行。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::delegate::{SessionTaskDelegate, TaskOutcome, TransferProgress};
use super::task::{TaskState, TransferTask};
use crate::cache::{ResultLocation, TaskCache, TaskErrorInfo, TaskKey, TaskKind};
use crate::transport::{TaskId, TransportCompletion, TransportEvent, TransportEventKind};

/// 投递队列中的一次回调
pub(crate) type Delivery = Box<dyn FnOnce() + Send + 'static>;

/// 回调引用
///
/// 后台/前台传输任务只持有弱引用；数据任务的完成闭包没有其他持有者，由任务表持有
pub(crate) enum DelegateRef {
    Weak(Weak<dyn SessionTaskDelegate>),
    Owned(Arc<dyn SessionTaskDelegate>),
}

impl DelegateRef {
    pub(crate) fn weak<D: SessionTaskDelegate + 'static>(delegate: &Arc<D>) -> Self {
        let delegate: Arc<dyn SessionTaskDelegate> = delegate.clone();
        DelegateRef::Weak(Arc::downgrade(&delegate))
    }

    fn upgrade(&self) -> Option<Arc<dyn SessionTaskDelegate>> {
        match self {
            DelegateRef::Weak(weak) => weak.upgrade(),
            DelegateRef::Owned(delegate) => Some(Arc::clone(delegate)),
        }
    }
}

struct LiveTask {
    task: TransferTask,
    delegate: Option<DelegateRef>,
}

type LiveKey = (String, TaskId);

pub(crate) struct DelegateDispatcher {
    live: Mutex<HashMap<LiveKey, LiveTask>>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
}

impl DelegateDispatcher {
    /// 返回分发器和投递队列的接收端（由投递任务消费）
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        (
            Self {
                live: Mutex::new(HashMap::new()),
                delivery_tx,
            },
            delivery_rx,
        )
    }

    // ========================================================================
    // 存活任务表
    // ========================================================================

    /// 登记任务，已存在时替换回调
    pub(crate) fn register(&self, task: TransferTask, delegate: Option<DelegateRef>) {
        let key = (task.session_id().to_string(), task.task_id());
        trace!("登记存活任务: {:?}", task);
        self.live.lock().insert(key, LiveTask { task, delegate });
    }

    pub(crate) fn attach_delegate(
        &self,
        session_id: &str,
        task_id: TaskId,
        delegate: DelegateRef,
    ) -> bool {
        match self.live.lock().get_mut(&(session_id.to_string(), task_id)) {
            Some(entry) => {
                entry.delegate = Some(delegate);
                true
            }
            None => false,
        }
    }

    pub(crate) fn live_task(&self, session_id: &str, task_id: TaskId) -> Option<TransferTask> {
        self.live
            .lock()
            .get(&(session_id.to_string(), task_id))
            .map(|entry| entry.task.clone())
    }

    pub(crate) fn live_task_for_key(&self, key: &TaskKey) -> Option<TransferTask> {
        self.live
            .lock()
            .values()
            .find(|entry| entry.task.key() == Some(key))
            .map(|entry| entry.task.clone())
    }

    /// 移出任务表，回调不再收到事件
    pub(crate) fn detach(&self, session_id: &str, task_id: TaskId) -> Option<TransferTask> {
        self.live
            .lock()
            .remove(&(session_id.to_string(), task_id))
            .map(|entry| entry.task)
    }

    pub(crate) fn detach_key(&self, key: &TaskKey) -> Option<TransferTask> {
        let mut live = self.live.lock();
        let live_key = live
            .iter()
            .find(|(_, entry)| entry.task.key() == Some(key))
            .map(|(live_key, _)| live_key.clone())?;
        live.remove(&live_key).map(|entry| entry.task)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    // ========================================================================
    // 事件分发
    // ========================================================================

    /// 分发一个传输层事件
    ///
    /// `cache` 仅在事件属于后台会话时提供
    pub(crate) async fn dispatch(&self, event: TransportEvent, cache: Option<&TaskCache>) {
        let TransportEvent {
            session_id,
            task_id,
            kind,
        } = event;

        match kind {
            TransportEventKind::Response(response) => {
                self.deliver_to_live(&session_id, task_id, move |delegate, task| {
                    if let Some(handler) = delegate.as_response_handler() {
                        handler.session_task_did_receive_response(task, &response);
                    }
                });
            }
            TransportEventKind::Data(data) => {
                self.deliver_to_live(&session_id, task_id, move |delegate, task| {
                    if let Some(handler) = delegate.as_data_handler() {
                        handler.session_task_did_receive_data(task, &data);
                    }
                });
            }
            TransportEventKind::Progress {
                bytes_transferred,
                bytes_expected,
            } => {
                let progress = TransferProgress {
                    bytes_transferred,
                    bytes_expected,
                };
                self.deliver_to_live(&session_id, task_id, move |delegate, task| {
                    if let Some(handler) = delegate.as_progress_handler() {
                        handler.session_task_did_report_progress(task, progress);
                    }
                });
            }
            TransportEventKind::Completed(completion) => {
                self.complete(session_id, task_id, completion, cache).await;
            }
        }
    }

    async fn complete(
        &self,
        session_id: String,
        task_id: TaskId,
        completion: TransportCompletion,
        cache: Option<&TaskCache>,
    ) {
        let live_key = (session_id.clone(), task_id);

        let (entry, outcome) = match cache {
            Some(cache) => {
                let _guard = cache.lock().await;
                let entry = self.live.lock().remove(&live_key);
                let outcome = persist_completion(
                    cache,
                    &session_id,
                    task_id,
                    entry.as_ref().map(|e| &e.task),
                    completion,
                )
                .await;
                (entry, outcome)
            }
            None => {
                let entry = self.live.lock().remove(&live_key);
                let destination = entry
                    .as_ref()
                    .and_then(|e| e.task.path().map(Path::to_path_buf));
                let kind = entry.as_ref().map(|e| e.task.kind());
                let outcome = settle_outcome(kind, destination.as_deref(), completion).await;
                (entry, outcome)
            }
        };

        let Some(LiveTask { task, delegate }) = entry else {
            debug!(
                "完成事件没有存活任务: session={}, task_id={}",
                session_id, task_id
            );
            return;
        };

        task.set_state(match &outcome.error {
            None => TaskState::Completed,
            Some(error) if error.is_cancelled() => TaskState::Cancelled,
            Some(_) => TaskState::Failed,
        });
        debug!("任务结束: {:?}", task);

        match delegate.and_then(|d| d.upgrade()) {
            Some(delegate) => {
                self.enqueue(Box::new(move || {
                    delegate.session_task_did_finish(&task, &outcome);
                }));
            }
            None => trace!("任务回调已释放: task_id={}", task_id),
        }
    }

    fn deliver_to_live<F>(&self, session_id: &str, task_id: TaskId, f: F)
    where
        F: FnOnce(&dyn SessionTaskDelegate, &TransferTask) + Send + 'static,
    {
        let target = {
            let live = self.live.lock();
            live.get(&(session_id.to_string(), task_id)).and_then(|entry| {
                let delegate = entry.delegate.as_ref()?.upgrade()?;
                Some((delegate, entry.task.clone()))
            })
        };

        let Some((delegate, task)) = target else {
            trace!(
                "丢弃中间事件（无存活回调）: session={}, task_id={}",
                session_id,
                task_id
            );
            return;
        };

        self.enqueue(Box::new(move || f(delegate.as_ref(), &task)));
    }

    fn enqueue(&self, delivery: Delivery) {
        if self.delivery_tx.send(delivery).is_err() {
            warn!("投递队列已关闭，回调被丢弃");
        }
    }
}

/// 后台任务完成：写入缓存记录，返回交给回调的结果
///
/// 调用方持有作用域锁
async fn persist_completion(
    cache: &TaskCache,
    session_id: &str,
    task_id: TaskId,
    live_task: Option<&TransferTask>,
    completion: TransportCompletion,
) -> TaskOutcome {
    let key = live_task
        .and_then(|task| task.key().cloned())
        .or_else(|| cache.key_for_task(session_id, task_id));

    let record = key
        .as_ref()
        .and_then(|key| cache.lookup(key))
        .filter(|info| info.session_id == session_id && info.task_id == task_id);

    let Some(mut record) = record else {
        // 记录已被清理：没有地方保存结果，下载的临时文件一并删除
        if live_task.is_none() {
            if let Some(location) = &completion.location {
                if let Err(e) = tokio::fs::remove_file(location).await {
                    debug!("删除孤立下载文件失败 {:?}: {}", location, e);
                }
            }
        }
        debug!(
            "完成事件找不到任务记录（可能已清理）: session={}, task_id={}",
            session_id, task_id
        );
        let destination = live_task.and_then(|t| t.path().map(Path::to_path_buf));
        return settle_outcome(
            live_task.map(TransferTask::kind),
            destination.as_deref(),
            completion,
        )
        .await;
    };

    if record.completed {
        debug!("任务记录已完成，忽略重复的完成事件: {}", record.key());
        return TaskOutcome::from(&record);
    }

    let mut outcome =
        settle_outcome(Some(record.task_kind), record.path.as_deref(), completion).await;

    record.mark_completed(
        outcome.response.clone(),
        outcome.error.clone(),
        outcome.result.clone(),
        outcome.resume_data.clone(),
    );
    match cache.store(&record) {
        Ok(()) => info!(
            "任务完成已写入缓存: key={}, status={:?}, error={:?}",
            record.key(),
            record.status(),
            record.error.as_ref().map(ToString::to_string)
        ),
        Err(e) => {
            // 结果没有落盘，不能按成功上报
            error!("写入任务完成记录失败 {}: {}", record.key(), e);
            outcome.error = Some(TaskErrorInfo::io(format!("完成记录写入失败: {}", e)));
        }
    }

    outcome
}

/// 整理完成结果：下载文件移动到目标路径，响应体作为载荷
async fn settle_outcome(
    kind: Option<TaskKind>,
    destination: Option<&Path>,
    completion: TransportCompletion,
) -> TaskOutcome {
    let TransportCompletion {
        response,
        location,
        data,
        mut error,
        resume_data,
    } = completion;

    let result = match (kind, location) {
        (Some(TaskKind::Download), Some(location)) | (None, Some(location)) => match destination {
            Some(destination) => match move_file(&location, destination).await {
                Ok(()) => Some(ResultLocation::File {
                    path: destination.to_path_buf(),
                }),
                Err(e) => {
                    warn!(
                        "移动下载文件失败 {:?} -> {:?}: {}",
                        location, destination, e
                    );
                    if error.is_none() {
                        error = Some(TaskErrorInfo::io(e.to_string()));
                    }
                    None
                }
            },
            None => Some(ResultLocation::File { path: location }),
        },
        _ => data.clone().map(|data| ResultLocation::Payload { data }),
    };

    TaskOutcome {
        response,
        data,
        result,
        error,
        resume_data,
    }
}

/// 重命名失败（如跨设备）时退回到复制
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}
