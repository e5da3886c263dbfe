//! 会话注册表
//!
//! - 一次性初始化（宿主应用 / 扩展，两者互斥）
//! - 记录本进程接管的全部后台会话（初始化的会话 + reconnect 的会话）
//! - 懒创建前台会话（不落盘，不需要初始化）

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TaskCache;
use crate::cipher::CacheCipher;
use crate::error::{SessionError, SessionResult};
use crate::transport::{EventSink, Transport};

/// 后台会话标识 + 缓存根目录
///
/// 需要观察或接管同一批任务的进程必须使用相同的一对值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub root_cache_dir: PathBuf,
}

/// 初始化上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupContext {
    HostApp,
    Extension,
}

enum SetupState {
    NotConfigured,
    Configured {
        identity: SessionIdentity,
        context: SetupContext,
        cache: Arc<TaskCache>,
    },
}

pub(crate) struct SessionRegistry {
    transport: Arc<dyn Transport>,
    sink: EventSink,
    state: RwLock<SetupState>,
    /// 串行化 setup / reconnect
    setup_lock: Mutex<()>,
    /// 已接管的后台会话，第一个是初始化时的会话
    background: RwLock<Vec<String>>,
    foreground: Mutex<Option<String>>,
}

impl SessionRegistry {
    pub(crate) fn new(transport: Arc<dyn Transport>, sink: EventSink) -> Self {
        Self {
            transport,
            sink,
            state: RwLock::new(SetupState::NotConfigured),
            setup_lock: Mutex::new(()),
            background: RwLock::new(Vec::new()),
            foreground: Mutex::new(None),
        }
    }

    /// 一次性初始化
    pub(crate) async fn setup(
        &self,
        context: SetupContext,
        session_id: &str,
        cipher: Arc<dyn CacheCipher>,
        root_cache_dir: PathBuf,
    ) -> SessionResult<SessionIdentity> {
        let _guard = self.setup_lock.lock().await;

        if let SetupState::Configured { identity, .. } = &*self.state.read() {
            warn!(
                "重复初始化被拒绝，已使用会话: {}",
                identity.session_id
            );
            return Err(SessionError::AlreadyConfigured(identity.session_id.clone()));
        }

        if session_id.is_empty() {
            return Err(SessionError::InvalidArgument(
                "session_id 不能为空".to_string(),
            ));
        }

        let cache = Arc::new(TaskCache::open(root_cache_dir.clone(), cipher)?);
        let identity = SessionIdentity {
            session_id: session_id.to_string(),
            root_cache_dir,
        };

        // 先登记再连接：连接时重放的完成事件需要能找到缓存
        *self.state.write() = SetupState::Configured {
            identity: identity.clone(),
            context,
            cache,
        };
        self.background.write().push(session_id.to_string());

        if let Err(e) = self.transport.attach(session_id, self.sink.clone()).await {
            *self.state.write() = SetupState::NotConfigured;
            self.background.write().clear();
            return Err(e.into());
        }

        info!(
            "会话管理器初始化完成: context={:?}, session={}, cache={:?}",
            context, identity.session_id, identity.root_cache_dir
        );
        Ok(identity)
    }

    /// 接管已有的后台会话，传输层会重放无人接收期间的完成事件
    pub(crate) async fn reconnect(&self, session_id: &str) -> SessionResult<()> {
        let _guard = self.setup_lock.lock().await;
        self.identity()?;

        if session_id.is_empty() {
            return Err(SessionError::InvalidArgument(
                "session_id 不能为空".to_string(),
            ));
        }

        let added = {
            let mut background = self.background.write();
            if background.iter().any(|s| s == session_id) {
                false
            } else {
                background.push(session_id.to_string());
                true
            }
        };

        if let Err(e) = self.transport.attach(session_id, self.sink.clone()).await {
            if added {
                self.background.write().retain(|s| s != session_id);
            }
            return Err(e.into());
        }

        info!("已重新连接后台会话: {}", session_id);
        Ok(())
    }

    pub(crate) fn identity(&self) -> SessionResult<SessionIdentity> {
        match &*self.state.read() {
            SetupState::Configured { identity, .. } => Ok(identity.clone()),
            SetupState::NotConfigured => Err(SessionError::NotConfigured),
        }
    }

    pub(crate) fn context(&self) -> Option<SetupContext> {
        match &*self.state.read() {
            SetupState::Configured { context, .. } => Some(*context),
            SetupState::NotConfigured => None,
        }
    }

    pub(crate) fn cache(&self) -> SessionResult<Arc<TaskCache>> {
        match &*self.state.read() {
            SetupState::Configured { cache, .. } => Ok(Arc::clone(cache)),
            SetupState::NotConfigured => Err(SessionError::NotConfigured),
        }
    }

    /// 初始化时的后台会话，新任务都创建在这里
    pub(crate) fn background_session_id(&self) -> SessionResult<String> {
        self.identity().map(|identity| identity.session_id)
    }

    pub(crate) fn background_sessions(&self) -> Vec<String> {
        self.background.read().clone()
    }

    pub(crate) fn is_background_session(&self, session_id: &str) -> bool {
        self.background.read().iter().any(|s| s == session_id)
    }

    /// 后台会话的事件需要落盘，返回对应缓存
    pub(crate) fn cache_for_session(&self, session_id: &str) -> Option<Arc<TaskCache>> {
        if self.is_background_session(session_id) {
            self.cache().ok()
        } else {
            None
        }
    }

    /// 前台会话，首次使用时创建
    pub(crate) async fn foreground_session(&self) -> SessionResult<String> {
        let mut foreground = self.foreground.lock().await;
        if let Some(session_id) = foreground.as_ref() {
            return Ok(session_id.clone());
        }

        let session_id = format!("foreground-{}", Uuid::new_v4());
        self.transport.attach(&session_id, self.sink.clone()).await?;
        debug!("前台会话已创建: {}", session_id);

        *foreground = Some(session_id.clone());
        Ok(session_id)
    }

    /// 放弃所有会话的事件接收，传输层中的任务继续运行
    pub(crate) async fn detach_all(&self) {
        for session_id in self.background_sessions() {
            self.transport.detach(&session_id).await;
        }
        if let Some(session_id) = self.foreground.lock().await.take() {
            self.transport.detach(&session_id).await;
        }
        debug!("已断开全部会话");
    }
}
