//! 传输会话管理器
//!
//! 对外入口。负责：
//! - 后台下载/上传任务的创建与复用（同一 (user_id, associate_id) 幂等）
//! - 从断点数据恢复下载
//! - 完成结果查询、清理、按用户批量取消
//! - 列出后台会话中尚未结束的任务
//! - 前台数据/下载/上传任务
//!
//! ## 任务创建顺序
//!
//! 传输层任务创建后先写缓存记录、登记存活任务，再把句柄交给调用方；
//! 任务处于挂起状态，调用方调用 `TransferTask::resume` 开始传输。

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delegate::{CompletionDelegate, DataTaskResult, SessionTaskDelegate};
use super::dispatcher::{DelegateDispatcher, DelegateRef, Delivery};
use super::registry::{SessionIdentity, SessionRegistry, SetupContext};
use super::task::{TaskState, TransferTask};
use crate::cache::{CachedTaskInfo, PendingEntry, TaskKey, TaskKind};
use crate::cipher::CacheCipher;
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::transport::{TaskId, TransferRequest, Transport, TransportError, TransportEvent};

/// 后台会话中尚未结束的任务
#[derive(Debug, Clone, Default)]
pub struct PendingTasks {
    pub uploads: Vec<TransferTask>,
    pub downloads: Vec<TransferTask>,
}

impl PendingTasks {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.downloads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.uploads.len() + self.downloads.len()
    }
}

/// 创建传输层任务所需的输入
enum TaskSource<'a> {
    Download(&'a TransferRequest),
    ResumeData(&'a [u8]),
    Upload {
        request: &'a TransferRequest,
        source: &'a Path,
    },
}

impl TaskSource<'_> {
    fn kind(&self) -> TaskKind {
        match self {
            TaskSource::Download(_) | TaskSource::ResumeData(_) => TaskKind::Download,
            TaskSource::Upload { .. } => TaskKind::Upload,
        }
    }
}

struct ManagerInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<DelegateDispatcher>,
    /// 停止事件泵
    shutdown: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 传输会话管理器
///
/// 克隆共享同一份状态。需要在 tokio 运行时内创建：构造时启动事件泵和回调投递两个任务。
#[derive(Clone)]
pub struct TransferSessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TransferSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSessionManager")
            .field("identity", &self.inner.registry.identity().ok())
            .field("live_tasks", &self.inner.dispatcher.live_count())
            .finish()
    }
}

impl TransferSessionManager {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (dispatcher, delivery_rx) = DelegateDispatcher::new();
        let shutdown = CancellationToken::new();

        let registry = Arc::new(SessionRegistry::new(Arc::clone(&transport), event_tx));
        let dispatcher = Arc::new(dispatcher);

        tokio::spawn(run_event_pump(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            event_rx,
            shutdown.clone(),
        ));
        tokio::spawn(run_delivery_worker(delivery_rx));

        let inner = Arc::new(ManagerInner {
            config,
            registry,
            transport,
            dispatcher,
            shutdown,
        });

        debug!("传输会话管理器已创建");
        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// 初始化后的会话标识
    pub fn identity(&self) -> SessionResult<SessionIdentity> {
        self.inner.registry.identity()
    }

    pub fn setup_context(&self) -> Option<SetupContext> {
        self.inner.registry.context()
    }

    // ========================================================================
    // 会话
    // ========================================================================

    /// 宿主应用初始化，后台会话标识取自配置
    pub async fn one_time_setup(
        &self,
        cipher: Arc<dyn CacheCipher>,
        root_cache_dir: impl Into<PathBuf>,
    ) -> SessionResult<SessionIdentity> {
        let session_id = self.inner.config.background_session_id.clone();
        self.inner
            .registry
            .setup(
                SetupContext::HostApp,
                &session_id,
                cipher,
                root_cache_dir.into(),
            )
            .await
    }

    /// 扩展初始化，使用调用方提供的后台会话标识
    pub async fn one_time_setup_for_extension(
        &self,
        session_id: &str,
        cipher: Arc<dyn CacheCipher>,
        root_cache_dir: impl Into<PathBuf>,
    ) -> SessionResult<SessionIdentity> {
        self.inner
            .registry
            .setup(
                SetupContext::Extension,
                session_id,
                cipher,
                root_cache_dir.into(),
            )
            .await
    }

    /// 接管已有后台会话（通常是宿主应用接管扩展启动的任务）
    ///
    /// 使用初始化时的缓存根目录，必须与原会话一致
    pub async fn reconnect(&self, session_id: &str) -> SessionResult<()> {
        self.inner.registry.reconnect(session_id).await
    }

    /// 断开所有会话的事件接收，传输层中的任务继续运行
    pub async fn shutdown(&self) {
        self.inner.registry.detach_all().await;
        info!("传输会话管理器已断开");
    }

    // ========================================================================
    // 后台任务
    // ========================================================================

    /// 后台下载
    ///
    /// 同一 (user_id, associate_id) 重复调用返回同一个任务并重新绑定回调；
    /// 已完成的任务返回 `AlreadyCompleted`
    pub async fn background_download<D>(
        &self,
        request: &TransferRequest,
        destination: impl Into<PathBuf>,
        delegate: &Arc<D>,
        user_id: &str,
        associate_id: &str,
    ) -> SessionResult<TransferTask>
    where
        D: SessionTaskDelegate + 'static,
    {
        self.create_or_reuse(
            TaskKey::new(user_id, associate_id),
            TaskSource::Download(request),
            destination.into(),
            DelegateRef::weak(delegate),
        )
        .await
    }

    /// 从断点数据恢复后台下载，断点格式由传输层定义
    pub async fn background_download_from_resume_data<D>(
        &self,
        resume_data: &[u8],
        destination: impl Into<PathBuf>,
        delegate: &Arc<D>,
        user_id: &str,
        associate_id: &str,
    ) -> SessionResult<TransferTask>
    where
        D: SessionTaskDelegate + 'static,
    {
        self.create_or_reuse(
            TaskKey::new(user_id, associate_id),
            TaskSource::ResumeData(resume_data),
            destination.into(),
            DelegateRef::weak(delegate),
        )
        .await
    }

    /// 后台上传
    pub async fn background_upload<D>(
        &self,
        request: &TransferRequest,
        source_file: impl AsRef<Path>,
        delegate: &Arc<D>,
        user_id: &str,
        associate_id: &str,
    ) -> SessionResult<TransferTask>
    where
        D: SessionTaskDelegate + 'static,
    {
        let source = source_file.as_ref();
        if !source.is_file() {
            return Err(SessionError::InvalidArgument(format!(
                "上传源文件不存在: {:?}",
                source
            )));
        }

        self.create_or_reuse(
            TaskKey::new(user_id, associate_id),
            TaskSource::Upload { request, source },
            source.to_path_buf(),
            DelegateRef::weak(delegate),
        )
        .await
    }

    async fn create_or_reuse(
        &self,
        key: TaskKey,
        source: TaskSource<'_>,
        path: PathBuf,
        delegate: DelegateRef,
    ) -> SessionResult<TransferTask> {
        key.validate()?;
        let cache = self.inner.registry.cache()?;
        let session_id = self.inner.registry.background_session_id()?;
        let kind = source.kind();

        let _guard = cache.lock().await;

        let Some(mut record) = cache.lookup(&key) else {
            let task_id = self.create_transport_task(&session_id, &source).await?;
            let record = CachedTaskInfo::new_pending(&key, kind, &session_id, task_id, Some(path));

            if let Err(e) = cache.store(&record) {
                // 没有记录的任务无法被发现，直接取消
                let _ = self.inner.transport.cancel_task(&session_id, task_id).await;
                return Err(e);
            }

            let task = self.register_record(&record, Some(delegate));
            info!("创建后台任务: key={}, kind={}, task_id={}", key, kind, task_id);
            return Ok(task);
        };

        if record.completed {
            debug!("任务已完成，拒绝重新创建: {}", key);
            return Err(SessionError::AlreadyCompleted(key));
        }

        if record.task_kind != kind {
            return Err(SessionError::InvalidArgument(format!(
                "任务 {} 已存在，类型为 {}",
                key, record.task_kind
            )));
        }

        // 本进程已登记
        if let Some(task) = self
            .inner
            .dispatcher
            .live_task(&record.session_id, record.task_id)
        {
            self.inner
                .dispatcher
                .attach_delegate(&record.session_id, record.task_id, delegate);
            info!("复用存活任务: key={}, task_id={}", key, record.task_id);
            return Ok(task);
        }

        // 传输层仍有该任务（例如进程重启后）
        let live = self
            .inner
            .transport
            .tasks(&record.session_id)
            .await?
            .into_iter()
            .find(|info| info.task_id == record.task_id);

        if let Some(info) = live {
            let task = self.register_record(&record, Some(delegate));
            task.set_state(info.state.into());
            info!("重新绑定传输层任务: key={}, task_id={}", key, record.task_id);
            return Ok(task);
        }

        // 传输层已丢失任务，重建并改绑记录
        let task_id = self.create_transport_task(&session_id, &source).await?;
        warn!(
            "传输层已丢失任务，重建: key={}, 旧 task_id={}, 新 task_id={}",
            key, record.task_id, task_id
        );

        cache.delete_index(&record.session_id, record.task_id)?;
        record.rebind(&session_id, task_id);
        record.path = Some(path);
        cache.store(&record)?;

        Ok(self.register_record(&record, Some(delegate)))
    }

    async fn create_transport_task(
        &self,
        session_id: &str,
        source: &TaskSource<'_>,
    ) -> SessionResult<TaskId> {
        let transport = &self.inner.transport;
        let task_id = match source {
            TaskSource::Download(request) => {
                transport.create_download_task(session_id, request).await?
            }
            TaskSource::ResumeData(resume_data) => {
                transport
                    .create_download_task_with_resume_data(session_id, resume_data)
                    .await?
            }
            TaskSource::Upload { request, source } => {
                transport
                    .create_upload_task(session_id, request, source)
                    .await?
            }
        };
        Ok(task_id)
    }

    fn register_record(
        &self,
        record: &CachedTaskInfo,
        delegate: Option<DelegateRef>,
    ) -> TransferTask {
        let task = TransferTask::new(
            record.task_kind,
            record.session_id.clone(),
            record.task_id,
            Some(record.key()),
            record.path.clone(),
            Arc::clone(&self.inner.transport),
        );
        self.inner.dispatcher.register(task.clone(), delegate);
        task
    }

    // ========================================================================
    // 查询与清理
    // ========================================================================

    /// 读取已完成任务的缓存记录，不删除记录
    pub async fn session_task_completed_cached_info(
        &self,
        user_id: &str,
        associate_id: &str,
    ) -> SessionResult<CachedTaskInfo> {
        let key = TaskKey::new(user_id, associate_id);
        key.validate()?;
        let cache = self.inner.registry.cache()?;

        let _guard = cache.lock().await;
        match cache.lookup(&key) {
            Some(info) if info.completed => Ok(info),
            _ => Err(SessionError::NotFound(key)),
        }
    }

    /// 某个用户的全部缓存记录（包括未完成的）
    pub async fn cached_tasks_for_user(
        &self,
        user_id: &str,
    ) -> SessionResult<Vec<CachedTaskInfo>> {
        let cache = self.inner.registry.cache()?;
        let _guard = cache.lock().await;
        Ok(cache.list_for_user(user_id))
    }

    /// 删除缓存记录并解除回调绑定，不取消传输层任务
    ///
    /// 记录不存在视为成功
    pub async fn clean_up(&self, user_id: &str, associate_id: &str) -> SessionResult<()> {
        let key = TaskKey::new(user_id, associate_id);
        key.validate()?;
        let cache = self.inner.registry.cache()?;

        let _guard = cache.lock().await;
        if let Some(record) = cache.lookup(&key) {
            self.inner
                .dispatcher
                .detach(&record.session_id, record.task_id);
        }
        self.inner.dispatcher.detach_key(&key);

        if cache.delete(&key)? {
            info!("已清理任务: {}", key);
        }
        Ok(())
    }

    /// 取消并清理某个用户的全部任务
    ///
    /// 逐个处理，单个失败不影响其他任务；已完成或传输层已不存在的任务视为已解决
    pub async fn cancel_and_clean_up(&self, user_id: &str) -> SessionResult<()> {
        if user_id.is_empty() {
            return Err(SessionError::InvalidArgument(
                "user_id 不能为空".to_string(),
            ));
        }
        let cache = self.inner.registry.cache()?;

        let records = {
            let _guard = cache.lock().await;
            cache.list_for_user(user_id)
        };
        info!("取消用户任务: user_id={}, 共 {} 个", user_id, records.len());

        let mut failed = Vec::new();
        for record in records {
            let key = record.key();

            if !record.completed {
                match self
                    .inner
                    .transport
                    .cancel_task(&record.session_id, record.task_id)
                    .await
                {
                    Ok(()) | Err(TransportError::TaskNotFound { .. }) => {}
                    Err(e) => {
                        warn!("取消任务失败 {}: {}", key, e);
                        failed.push(key);
                        continue;
                    }
                }
            }

            let _guard = cache.lock().await;
            self.inner
                .dispatcher
                .detach(&record.session_id, record.task_id);
            if let Err(e) = cache.delete(&key) {
                warn!("删除任务缓存失败 {}: {}", key, e);
                failed.push(key);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(SessionError::CancellationPartialFailure { failed })
        }
    }

    /// 列出所有已接管后台会话中尚未结束的上传/下载任务
    pub async fn list_pending_tasks(&self) -> SessionResult<PendingTasks> {
        let cache = self.inner.registry.cache()?;
        let mut pending = PendingTasks::default();

        for session_id in self.inner.registry.background_sessions() {
            let live = self.inner.transport.tasks(&session_id).await?;

            let _guard = cache.lock().await;
            let (uploads, downloads) = cache.list_pending(&session_id, &live);
            pending
                .uploads
                .extend(uploads.into_iter().map(|entry| self.task_for_pending(entry)));
            pending
                .downloads
                .extend(downloads.into_iter().map(|entry| self.task_for_pending(entry)));
        }

        debug!(
            "待完成任务: {} 个上传, {} 个下载",
            pending.uploads.len(),
            pending.downloads.len()
        );
        Ok(pending)
    }

    fn task_for_pending(&self, entry: PendingEntry) -> TransferTask {
        if let Some(task) = self
            .inner
            .dispatcher
            .live_task(&entry.session_id, entry.task_id)
        {
            return task;
        }

        let task = TransferTask::new(
            entry.kind,
            entry.session_id,
            entry.task_id,
            entry.key,
            entry.path,
            Arc::clone(&self.inner.transport),
        );
        task.set_state(TaskState::from(entry.state));

        // 有记录的任务登记后可以通过 background_* 重新绑定回调
        if task.key().is_some() {
            self.inner.dispatcher.register(task.clone(), None);
        }
        task
    }

    // ========================================================================
    // 前台任务
    // ========================================================================

    /// 前台数据任务，响应体缓冲后交给完成闭包
    pub async fn data_task<F>(
        &self,
        request: &TransferRequest,
        completion: F,
    ) -> SessionResult<TransferTask>
    where
        F: FnOnce(DataTaskResult) + Send + 'static,
    {
        let session_id = self.inner.registry.foreground_session().await?;
        let task_id = self
            .inner
            .transport
            .create_data_task(&session_id, request)
            .await?;

        let task = TransferTask::new(
            TaskKind::Data,
            session_id,
            task_id,
            None,
            None,
            Arc::clone(&self.inner.transport),
        );
        let delegate: Arc<dyn SessionTaskDelegate> =
            Arc::new(CompletionDelegate::new(Box::new(completion)));
        self.inner
            .dispatcher
            .register(task.clone(), Some(DelegateRef::Owned(delegate)));

        debug!("创建数据任务: task_id={}", task_id);
        Ok(task)
    }

    /// 前台下载，不写缓存，完成后文件移动到 `destination`
    pub async fn foreground_download_task<D>(
        &self,
        request: &TransferRequest,
        destination: impl Into<PathBuf>,
        delegate: &Arc<D>,
    ) -> SessionResult<TransferTask>
    where
        D: SessionTaskDelegate + 'static,
    {
        let session_id = self.inner.registry.foreground_session().await?;
        let task_id = self
            .inner
            .transport
            .create_download_task(&session_id, request)
            .await?;

        let task = TransferTask::new(
            TaskKind::Download,
            session_id,
            task_id,
            None,
            Some(destination.into()),
            Arc::clone(&self.inner.transport),
        );
        self.inner
            .dispatcher
            .register(task.clone(), Some(DelegateRef::weak(delegate)));

        debug!("创建前台下载任务: task_id={}", task_id);
        Ok(task)
    }

    /// 前台上传，不写缓存
    pub async fn foreground_upload_task<D>(
        &self,
        request: &TransferRequest,
        source_file: impl AsRef<Path>,
        delegate: &Arc<D>,
    ) -> SessionResult<TransferTask>
    where
        D: SessionTaskDelegate + 'static,
    {
        let source = source_file.as_ref();
        if !source.is_file() {
            return Err(SessionError::InvalidArgument(format!(
                "上传源文件不存在: {:?}",
                source
            )));
        }

        let session_id = self.inner.registry.foreground_session().await?;
        let task_id = self
            .inner
            .transport
            .create_upload_task(&session_id, request, source)
            .await?;

        let task = TransferTask::new(
            TaskKind::Upload,
            session_id,
            task_id,
            None,
            Some(source.to_path_buf()),
            Arc::clone(&self.inner.transport),
        );
        self.inner
            .dispatcher
            .register(task.clone(), Some(DelegateRef::weak(delegate)));

        debug!("创建前台上传任务: task_id={}", task_id);
        Ok(task)
    }
}

/// 事件泵：传输层事件 -> 分发器，按到达顺序逐个处理
///
/// 管理器释放后不再接收新事件，已进入通道的事件仍然处理完再退出
async fn run_event_pump(
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<DelegateDispatcher>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => None,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        pump_event(&registry, &dispatcher, event).await;
    }

    // 关闭后传输层发送失败，完成事件回到传输层暂存
    events.close();
    let mut drained = 0usize;
    while let Some(event) = events.recv().await {
        pump_event(&registry, &dispatcher, event).await;
        drained += 1;
    }
    debug!("事件泵已退出，退出前处理积压事件 {} 个", drained);
}

async fn pump_event(
    registry: &SessionRegistry,
    dispatcher: &DelegateDispatcher,
    event: TransportEvent,
) {
    let cache = registry.cache_for_session(&event.session_id);
    dispatcher.dispatch(event, cache.as_deref()).await;
}

/// 回调投递：单任务顺序执行，回调 panic 不影响后续投递
async fn run_delivery_worker(mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = deliveries.recv().await {
        if std::panic::catch_unwind(AssertUnwindSafe(delivery)).is_err() {
            error!("任务回调发生 panic，已忽略");
        }
    }
    debug!("回调投递任务已退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{store, ResultLocation, TaskErrorKind};
    use crate::cipher::PlainCipher;
    use crate::session::delegate::{ProgressHandler, TaskOutcome, TransferProgress};
    use crate::transport::MemoryTransport;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const BG: &str = "bg";

    /// 把完成回调转发到 channel 的测试回调
    struct ChannelDelegate {
        tx: mpsc::UnboundedSender<(TransferTask, TaskOutcome)>,
        progress: StdMutex<Vec<u64>>,
        with_progress: bool,
    }

    impl ChannelDelegate {
        fn new(
            with_progress: bool,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<(TransferTask, TaskOutcome)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    tx,
                    progress: StdMutex::new(Vec::new()),
                    with_progress,
                }),
                rx,
            )
        }
    }

    impl SessionTaskDelegate for ChannelDelegate {
        fn session_task_did_finish(&self, task: &TransferTask, outcome: &TaskOutcome) {
            let _ = self.tx.send((task.clone(), outcome.clone()));
        }

        fn as_progress_handler(&self) -> Option<&dyn ProgressHandler> {
            self.with_progress.then_some(self as &dyn ProgressHandler)
        }
    }

    impl ProgressHandler for ChannelDelegate {
        fn session_task_did_report_progress(&self, _task: &TransferTask, progress: TransferProgress) {
            self.progress.lock().unwrap().push(progress.bytes_transferred);
        }
    }

    struct Harness {
        temp_dir: TempDir,
        transport: MemoryTransport,
    }

    impl Harness {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let transport = MemoryTransport::new(temp_dir.path().join("work"));
            Self {
                temp_dir,
                transport,
            }
        }

        fn cache_dir(&self) -> PathBuf {
            self.temp_dir.path().join("cache")
        }

        fn path(&self, name: &str) -> PathBuf {
            self.temp_dir.path().join(name)
        }

        fn manager(&self) -> TransferSessionManager {
            let config = SessionConfig {
                background_session_id: BG.to_string(),
                ..SessionConfig::default()
            };
            TransferSessionManager::new(config, Arc::new(self.transport.clone()))
        }

        async fn host_manager(&self) -> TransferSessionManager {
            let manager = self.manager();
            manager
                .one_time_setup(Arc::new(PlainCipher), self.cache_dir())
                .await
                .unwrap();
            manager
        }
    }

    /// 把记录的临时文件位置占成目录，使该记录的写入失败
    fn block_record_writes(harness: &Harness, key: &TaskKey) -> PathBuf {
        let mut temp = store::record_path(&harness.cache_dir(), key).into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        std::fs::create_dir_all(&temp).unwrap();
        temp
    }

    fn request() -> TransferRequest {
        TransferRequest::get("https://files.example.com/content/1")
    }

    async fn recv_outcome(
        rx: &mut mpsc::UnboundedReceiver<(TransferTask, TaskOutcome)>,
    ) -> (TransferTask, TaskOutcome) {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("delegate channel closed")
    }

    async fn wait_completed(
        manager: &TransferSessionManager,
        user_id: &str,
        associate_id: &str,
    ) -> CachedTaskInfo {
        for _ in 0..500 {
            if let Ok(info) = manager
                .session_task_completed_cached_info(user_id, associate_id)
                .await
            {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record {}/{} never completed", user_id, associate_id);
    }

    #[tokio::test]
    async fn test_factory_requires_setup() {
        let harness = Harness::new();
        let manager = harness.manager();
        let (delegate, _rx) = ChannelDelegate::new(false);

        let result = manager
            .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
            .await;
        assert!(matches!(result, Err(SessionError::NotConfigured)));
        assert!(matches!(
            manager.list_pending_tasks().await,
            Err(SessionError::NotConfigured)
        ));
        assert_eq!(harness.transport.task_count(BG), 0);
    }

    #[tokio::test]
    async fn test_setup_entry_points_are_exclusive() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;

        let second = manager
            .one_time_setup_for_extension("ext", Arc::new(PlainCipher), harness.cache_dir())
            .await;
        assert!(matches!(second, Err(SessionError::AlreadyConfigured(_))));
        assert_eq!(manager.setup_context(), Some(SetupContext::HostApp));
        assert_eq!(manager.identity().unwrap().session_id, BG);
    }

    #[tokio::test]
    async fn test_idempotent_create() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (first_delegate, _first_rx) = ChannelDelegate::new(false);
        let (second_delegate, mut second_rx) = ChannelDelegate::new(false);

        let first = manager
            .background_download(&request(), harness.path("a.bin"), &first_delegate, "u1", "a1")
            .await
            .unwrap();
        // 记录在返回前已经写入
        let records = manager.cached_tasks_for_user("u1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, first.task_id());
        assert!(!records[0].completed);

        let second = manager
            .background_download(&request(), harness.path("a.bin"), &second_delegate, "u1", "a1")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(harness.transport.task_count(BG), 1);

        // 回调已切换到第二个
        first.resume().await.unwrap();
        harness
            .transport
            .complete_download(BG, first.task_id(), 200, b"data")
            .unwrap();
        let (task, outcome) = recv_outcome(&mut second_rx).await;
        assert_eq!(task, first);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_end_to_end_download() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, mut rx) = ChannelDelegate::new(true);
        let destination = harness.path("downloads/report.pdf");

        let task = manager
            .background_download(&request(), &destination, &delegate, "u1", "a1")
            .await
            .unwrap();
        assert_eq!(task.state(), TaskState::Pending);
        task.resume().await.unwrap();
        assert_eq!(task.state(), TaskState::Running);

        harness.transport.deliver_progress(BG, task.task_id(), 3, Some(7));
        harness
            .transport
            .complete_download(BG, task.task_id(), 200, b"payload")
            .unwrap();

        let (finished, outcome) = recv_outcome(&mut rx).await;
        assert_eq!(finished, task);
        assert_eq!(outcome.response.as_ref().map(|r| r.status), Some(200));
        assert_eq!(*delegate.progress.lock().unwrap(), vec![3]);
        assert_eq!(task.state(), TaskState::Completed);

        let info = manager
            .session_task_completed_cached_info("u1", "a1")
            .await
            .unwrap();
        assert!(info.completed);
        assert_eq!(info.status(), Some(200));
        assert_eq!(
            info.result,
            Some(ResultLocation::File {
                path: destination.clone()
            })
        );
        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");

        // 读取不会删除记录，已完成的键不能重新创建
        assert!(manager
            .session_task_completed_cached_info("u1", "a1")
            .await
            .is_ok());
        assert!(matches!(
            manager
                .background_download(&request(), &destination, &delegate, "u1", "a1")
                .await,
            Err(SessionError::AlreadyCompleted(_))
        ));

        manager.clean_up("u1", "a1").await.unwrap();
        assert!(matches!(
            manager.session_task_completed_cached_info("u1", "a1").await,
            Err(SessionError::NotFound(_))
        ));
        manager.clean_up("u1", "a1").await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_record_is_not_found() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);

        manager
            .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
            .await
            .unwrap();
        assert!(matches!(
            manager.session_task_completed_cached_info("u1", "a1").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_durable_completion_without_delegate() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, rx) = ChannelDelegate::new(false);

        let source = harness.path("photo.jpg");
        std::fs::write(&source, b"jpeg").unwrap();
        let task = manager
            .background_upload(
                &TransferRequest::post("https://files.example.com/upload"),
                &source,
                &delegate,
                "u1",
                "photo",
            )
            .await
            .unwrap();
        drop(delegate);
        drop(rx);

        harness
            .transport
            .complete_with_payload(BG, task.task_id(), 201, b"{\"id\":\"42\"}");

        let info = wait_completed(&manager, "u1", "photo").await;
        assert_eq!(info.task_kind, TaskKind::Upload);
        assert_eq!(info.status(), Some(201));
        assert_eq!(
            info.result,
            Some(ResultLocation::Payload {
                data: b"{\"id\":\"42\"}".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_cross_process_reconnect() {
        let harness = Harness::new();

        // 扩展进程创建任务后退出
        let extension = harness.manager();
        extension
            .one_time_setup_for_extension("ext", Arc::new(PlainCipher), harness.cache_dir())
            .await
            .unwrap();
        let (delegate, _rx) = ChannelDelegate::new(false);
        let first = extension
            .background_download(&request(), harness.path("1.bin"), &delegate, "u1", "a1")
            .await
            .unwrap();
        let second = extension
            .background_download(&request(), harness.path("2.bin"), &delegate, "u1", "a2")
            .await
            .unwrap();
        extension.shutdown().await;
        drop(extension);

        // 无人接收期间完成的事件由传输层暂存
        harness
            .transport
            .complete_download("ext", first.task_id(), 200, b"one")
            .unwrap();
        assert_eq!(harness.transport.pending_completions("ext"), 1);

        // 宿主应用使用相同的缓存目录接管
        let host = harness.host_manager().await;
        host.reconnect("ext").await.unwrap();

        let info = wait_completed(&host, "u1", "a1").await;
        assert_eq!(info.session_id, "ext");
        assert_eq!(std::fs::read(harness.path("1.bin")).unwrap(), b"one");

        let pending = host.list_pending_tasks().await.unwrap();
        assert!(pending.uploads.is_empty());
        assert_eq!(pending.downloads.len(), 1);
        assert_eq!(pending.downloads[0].task_id(), second.task_id());
        assert_eq!(pending.downloads[0].key(), Some(&TaskKey::new("u1", "a2")));

        // 接管后重新绑定回调
        let (host_delegate, mut host_rx) = ChannelDelegate::new(false);
        let reattached = host
            .background_download(&request(), harness.path("2.bin"), &host_delegate, "u1", "a2")
            .await
            .unwrap();
        assert_eq!(reattached, pending.downloads[0]);

        harness
            .transport
            .complete_download("ext", second.task_id(), 200, b"two")
            .unwrap();
        let (_, outcome) = recv_outcome(&mut host_rx).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_different_cache_dir_is_isolated() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);
        manager
            .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
            .await
            .unwrap();

        let other = harness.manager();
        other
            .one_time_setup(Arc::new(PlainCipher), harness.path("other-cache"))
            .await
            .unwrap();
        assert!(other.cached_tasks_for_user("u1").await.unwrap().is_empty());

        // 传输层的任务可见，但没有对应记录
        let pending = other.list_pending_tasks().await.unwrap();
        assert_eq!(pending.downloads.len(), 1);
        assert_eq!(pending.downloads[0].key(), None);
    }

    #[tokio::test]
    async fn test_scoped_cancellation() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);

        let a1 = manager
            .background_download(&request(), harness.path("a1"), &delegate, "u1", "a1")
            .await
            .unwrap();
        manager
            .background_download(&request(), harness.path("a2"), &delegate, "u1", "a2")
            .await
            .unwrap();
        let other = manager
            .background_download(&request(), harness.path("b1"), &delegate, "u2", "b1")
            .await
            .unwrap();

        // u1 的一个任务已完成
        harness
            .transport
            .complete_download(BG, a1.task_id(), 200, b"done")
            .unwrap();
        wait_completed(&manager, "u1", "a1").await;

        manager.cancel_and_clean_up("u1").await.unwrap();

        assert!(manager.cached_tasks_for_user("u1").await.unwrap().is_empty());
        let remaining = manager.cached_tasks_for_user("u2").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task_id, other.task_id());

        let pending = manager.list_pending_tasks().await.unwrap();
        assert_eq!(pending.downloads.len(), 1);
        assert_eq!(pending.downloads[0], other);
    }

    #[tokio::test]
    async fn test_cancellation_partial_failure() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);

        let stuck = manager
            .background_download(&request(), harness.path("a1"), &delegate, "u1", "a1")
            .await
            .unwrap();
        manager
            .background_download(&request(), harness.path("a2"), &delegate, "u1", "a2")
            .await
            .unwrap();
        harness.transport.fail_next_cancel(BG, stuck.task_id());

        match manager.cancel_and_clean_up("u1").await {
            Err(SessionError::CancellationPartialFailure { failed }) => {
                assert_eq!(failed, vec![TaskKey::new("u1", "a1")]);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // 取消失败的记录保留，其余已清理
        let remaining = manager.cached_tasks_for_user("u1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].associate_id, "a1");

        manager.cancel_and_clean_up("u1").await.unwrap();
        assert!(manager.cached_tasks_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_races_completion() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);

        let tasks = [
            manager
                .background_download(&request(), harness.path("a1"), &delegate, "u1", "a1")
                .await
                .unwrap(),
            manager
                .background_download(&request(), harness.path("a2"), &delegate, "u1", "a2")
                .await
                .unwrap(),
        ];

        // 完成事件与取消同时发生
        harness
            .transport
            .complete_download(BG, tasks[0].task_id(), 200, b"late")
            .unwrap();
        let (result, ()) = tokio::join!(manager.cancel_and_clean_up("u1"), async {
            harness
                .transport
                .complete_download(BG, tasks[1].task_id(), 200, b"late")
                .unwrap();
        });
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.cached_tasks_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_parity() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, mut rx) = ChannelDelegate::new(false);
        let destination = harness.path("big.iso");

        let task = manager
            .background_download(&request(), &destination, &delegate, "u1", "iso")
            .await
            .unwrap();
        task.resume().await.unwrap();
        harness.transport.fail_task(
            BG,
            task.task_id(),
            "network connection lost",
            Some(b"checkpoint-1".to_vec()),
        );

        let (_, outcome) = recv_outcome(&mut rx).await;
        assert!(!outcome.is_success());
        assert_eq!(task.state(), TaskState::Failed);

        let failed = manager
            .session_task_completed_cached_info("u1", "iso")
            .await
            .unwrap();
        let resume_data = failed.resume_data.clone().unwrap();
        assert_eq!(resume_data, b"checkpoint-1");
        manager.clean_up("u1", "iso").await.unwrap();

        let resumed = manager
            .background_download_from_resume_data(
                &resume_data,
                &destination,
                &delegate,
                "u1",
                "iso",
            )
            .await
            .unwrap();
        assert_ne!(resumed.task_id(), task.task_id());
        assert_eq!(
            harness.transport.task(BG, resumed.task_id()).unwrap().resume_data,
            Some(resume_data.clone())
        );

        // 与新建任务相同的复用路径
        let again = manager
            .background_download_from_resume_data(
                &resume_data,
                &destination,
                &delegate,
                "u1",
                "iso",
            )
            .await
            .unwrap();
        assert_eq!(again, resumed);

        harness
            .transport
            .complete_download(BG, resumed.task_id(), 200, b"iso")
            .unwrap();
        recv_outcome(&mut rx).await;
        let info = manager
            .session_task_completed_cached_info("u1", "iso")
            .await
            .unwrap();
        assert!(info.is_success());
        assert_eq!(info.task_id, resumed.task_id());
    }

    #[tokio::test]
    async fn test_invalid_resume_data_surfaces_transport_error() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);

        let result = manager
            .background_download_from_resume_data(&[], harness.path("x"), &delegate, "u1", "x")
            .await;
        match result {
            Err(SessionError::Transport(TransportError::InvalidResumeData(_))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(manager.cached_tasks_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_transport_task_is_reconstructed() {
        let harness = Harness::new();
        let (delegate, mut rx) = ChannelDelegate::new(false);

        let original = {
            let manager = harness.host_manager().await;
            manager
                .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
                .await
                .unwrap()
        };
        harness.transport.forget_task(BG, original.task_id());

        // 新进程，同一缓存目录
        let manager = harness.host_manager().await;
        let rebuilt = manager
            .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
            .await
            .unwrap();
        assert_ne!(rebuilt.task_id(), original.task_id());

        let records = manager.cached_tasks_for_user("u1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, rebuilt.task_id());

        harness
            .transport
            .complete_download(BG, rebuilt.task_id(), 200, b"rebuilt")
            .unwrap();
        let (task, _) = recv_outcome(&mut rx).await;
        assert_eq!(task, rebuilt);
    }

    #[tokio::test]
    async fn test_kind_mismatch_and_missing_source() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);

        let missing = manager
            .background_upload(&request(), harness.path("missing.jpg"), &delegate, "u1", "up")
            .await;
        assert!(matches!(missing, Err(SessionError::InvalidArgument(_))));

        manager
            .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
            .await
            .unwrap();
        let source = harness.path("a.jpg");
        std::fs::write(&source, b"jpeg").unwrap();
        let mismatch = manager
            .background_upload(&request(), &source, &delegate, "u1", "a1")
            .await;
        assert!(matches!(mismatch, Err(SessionError::InvalidArgument(_))));

        let empty_key = manager
            .background_download(&request(), harness.path("b.bin"), &delegate, "", "a1")
            .await;
        assert!(matches!(empty_key, Err(SessionError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_corrupted_record_reads_as_missing() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);

        let key = TaskKey::new("u1", "a1");
        store::write_atomic(&store::record_path(&harness.cache_dir(), &key), b"garbage").unwrap();

        assert!(matches!(
            manager.session_task_completed_cached_info("u1", "a1").await,
            Err(SessionError::NotFound(_))
        ));
        let task = manager
            .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
            .await
            .unwrap();
        assert_eq!(harness.transport.task_count(BG), 1);
        assert_eq!(task.key(), Some(&key));
    }

    #[tokio::test]
    async fn test_foreground_data_task() {
        let harness = Harness::new();
        // 前台任务不需要初始化
        let manager = harness.manager();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let task = manager
            .data_task(&TransferRequest::get("https://api.example.com/me"), move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();
        assert_eq!(task.kind(), TaskKind::Data);
        assert!(task.key().is_none());
        task.resume().await.unwrap();

        harness.transport.deliver_data(task.session_id(), task.task_id(), b"{\"na");
        harness
            .transport
            .complete_with_payload(task.session_id(), task.task_id(), 200, b"{\"name\":\"u1\"}");

        let (response, body) = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(body, b"{\"name\":\"u1\"}");
    }

    #[tokio::test]
    async fn test_foreground_download_moves_file() {
        let harness = Harness::new();
        let manager = harness.manager();
        let (delegate, mut rx) = ChannelDelegate::new(false);
        let destination = harness.path("fg/thumb.png");

        let task = manager
            .foreground_download_task(&request(), &destination, &delegate)
            .await
            .unwrap();
        task.resume().await.unwrap();
        harness
            .transport
            .complete_download(task.session_id(), task.task_id(), 200, b"png")
            .unwrap();

        let (_, outcome) = recv_outcome(&mut rx).await;
        assert_eq!(
            outcome.result,
            Some(ResultLocation::File {
                path: destination.clone()
            })
        );
        assert_eq!(std::fs::read(&destination).unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_delivery() {
        struct Panicky;
        impl SessionTaskDelegate for Panicky {
            fn session_task_did_finish(&self, _task: &TransferTask, _outcome: &TaskOutcome) {
                panic!("callback failure");
            }
        }

        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let panicky = Arc::new(Panicky);
        let (delegate, mut rx) = ChannelDelegate::new(false);

        let first = manager
            .background_download(&request(), harness.path("a"), &panicky, "u1", "a1")
            .await
            .unwrap();
        let second = manager
            .background_download(&request(), harness.path("b"), &delegate, "u1", "a2")
            .await
            .unwrap();

        harness
            .transport
            .complete_download(BG, first.task_id(), 200, b"a")
            .unwrap();
        harness
            .transport
            .complete_download(BG, second.task_id(), 200, b"b")
            .unwrap();

        let (task, _) = recv_outcome(&mut rx).await;
        assert_eq!(task, second);
        assert!(wait_completed(&manager, "u1", "a1").await.is_success());
    }

    #[tokio::test]
    async fn test_completion_in_flight_survives_manager_drop() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, mut rx) = ChannelDelegate::new(false);
        let destination = harness.path("downloads/late.bin");

        let task = manager
            .background_download(&request(), &destination, &delegate, "u1", "a1")
            .await
            .unwrap();
        task.resume().await.unwrap();

        // 完成事件已进入管理器的通道，管理器随即释放
        harness
            .transport
            .complete_download(BG, task.task_id(), 200, b"late")
            .unwrap();
        drop(manager);

        let (finished, outcome) = recv_outcome(&mut rx).await;
        assert_eq!(finished, task);
        assert!(outcome.is_success());
        assert_eq!(harness.transport.pending_completions(BG), 0);

        let takeover = harness.host_manager().await;
        let info = wait_completed(&takeover, "u1", "a1").await;
        assert!(info.is_success());
        assert_eq!(std::fs::read(&destination).unwrap(), b"late");
        assert!(matches!(
            takeover
                .background_download(&request(), &destination, &delegate, "u1", "a1")
                .await,
            Err(SessionError::AlreadyCompleted(_))
        ));
        assert_eq!(harness.transport.task_count(BG), 1);
    }

    #[tokio::test]
    async fn test_completion_write_failure_reaches_delegate() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, mut rx) = ChannelDelegate::new(false);

        let source = harness.path("photo.jpg");
        std::fs::write(&source, b"jpeg").unwrap();
        let task = manager
            .background_upload(
                &TransferRequest::post("https://files.example.com/upload"),
                &source,
                &delegate,
                "u1",
                "photo",
            )
            .await
            .unwrap();

        block_record_writes(&harness, &TaskKey::new("u1", "photo"));
        harness
            .transport
            .complete_with_payload(BG, task.task_id(), 201, b"{}");

        let (finished, outcome) = recv_outcome(&mut rx).await;
        assert_eq!(finished, task);
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.error.as_ref().map(|e| e.kind),
            Some(TaskErrorKind::Io)
        );
        assert_eq!(task.state(), TaskState::Failed);

        // 记录仍是未完成状态
        assert!(matches!(
            manager
                .session_task_completed_cached_info("u1", "photo")
                .await,
            Err(SessionError::NotFound(_))
        ));
        let records = manager.cached_tasks_for_user("u1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].completed);
    }

    #[tokio::test]
    async fn test_record_write_failure_cancels_new_task() {
        let harness = Harness::new();
        let manager = harness.host_manager().await;
        let (delegate, _rx) = ChannelDelegate::new(false);
        let blocked = block_record_writes(&harness, &TaskKey::new("u1", "a1"));

        let result = manager
            .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
            .await;
        assert!(matches!(result, Err(SessionError::Io(_))));

        // 传输层任务已创建但被取消，不会留下无法发现的任务
        assert_eq!(harness.transport.task_count(BG), 1);
        assert!(harness.transport.tasks(BG).await.unwrap().is_empty());
        assert!(manager.cached_tasks_for_user("u1").await.unwrap().is_empty());

        std::fs::remove_dir(&blocked).unwrap();
        let task = manager
            .background_download(&request(), harness.path("a.bin"), &delegate, "u1", "a1")
            .await
            .unwrap();
        assert_eq!(harness.transport.tasks(BG).await.unwrap().len(), 1);
        assert_eq!(task.state(), TaskState::Pending);
    }
}
