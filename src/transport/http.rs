//! 基于 reqwest 的进程内传输
//!
//! - 下载流式写入 `work_dir` 下的 `.part` 文件，完成后把文件位置交给上层
//! - 挂起后恢复时按已写入长度发送 Range 请求续传
//! - 取消或网络失败时生成断点数据（JSON：请求 + 部分文件路径）
//! - 上传一次性读取源文件作为请求体

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{header, Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hub::SessionHub;
use super::{
    EventSink, TaskId, TransferRequest, Transport, TransportCompletion, TransportError,
    TransportEvent, TransportEventKind, TransportTaskInfo, TransportTaskState,
};
use crate::cache::{ResponseMetadata, TaskErrorInfo, TaskKind};
use crate::config::HttpConfig;

/// 断点数据格式版本
const CHECKPOINT_VERSION: u32 = 1;

/// 断点数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ResumeCheckpoint {
    version: u32,
    request: TransferRequest,
    partial_path: PathBuf,
    bytes_received: u64,
}

impl ResumeCheckpoint {
    fn capture(request: &TransferRequest, partial_path: &Path) -> Option<Vec<u8>> {
        let bytes_received = std::fs::metadata(partial_path).map(|m| m.len()).ok()?;
        let checkpoint = Self {
            version: CHECKPOINT_VERSION,
            request: request.clone(),
            partial_path: partial_path.to_path_buf(),
            bytes_received,
        };
        serde_json::to_vec(&checkpoint).ok()
    }

    fn parse(data: &[u8]) -> Result<Self, TransportError> {
        let checkpoint: Self = serde_json::from_slice(data)
            .map_err(|e| TransportError::InvalidResumeData(e.to_string()))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(TransportError::InvalidResumeData(format!(
                "不支持的断点版本: {}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }
}

#[derive(Debug, Clone)]
enum HttpTaskPlan {
    Download {
        request: TransferRequest,
        partial_path: PathBuf,
    },
    Upload {
        request: TransferRequest,
        source: PathBuf,
    },
    Data {
        request: TransferRequest,
    },
}

impl HttpTaskPlan {
    fn kind(&self) -> TaskKind {
        match self {
            HttpTaskPlan::Download { .. } => TaskKind::Download,
            HttpTaskPlan::Upload { .. } => TaskKind::Upload,
            HttpTaskPlan::Data { .. } => TaskKind::Data,
        }
    }

    fn checkpoint(&self) -> Option<Vec<u8>> {
        match self {
            HttpTaskPlan::Download {
                request,
                partial_path,
            } => ResumeCheckpoint::capture(request, partial_path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    None,
    Suspend,
    Cancel,
}

/// 正在运行的任务的控制句柄
struct TaskControl {
    generation: u64,
    token: CancellationToken,
    stop: Arc<Mutex<StopReason>>,
}

struct HttpTask {
    plan: HttpTaskPlan,
    state: TransportTaskState,
    control: Option<TaskControl>,
}

enum JobOutcome {
    Finished(TransportCompletion),
    Stopped,
}

struct HttpInner {
    client: Client,
    config: HttpConfig,
    hub: SessionHub,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    tasks: DashMap<(String, TaskId), HttpTask>,
}

/// 基于 reqwest 的传输实现
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<HttpInner>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("work_dir", &self.inner.config.work_dir)
            .field("tasks", &self.inner.tasks.len())
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        std::fs::create_dir_all(&config.work_dir)?;

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()?;

        info!("HTTP 传输已创建，临时目录: {:?}", config.work_dir);

        Ok(Self {
            inner: Arc::new(HttpInner {
                client,
                config,
                hub: SessionHub::default(),
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                tasks: DashMap::new(),
            }),
        })
    }

    fn insert_task(&self, session_id: &str, plan: HttpTaskPlan) -> TaskId {
        let task_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(
            "HTTP 传输创建任务: session={}, task_id={}, kind={}",
            session_id,
            task_id,
            plan.kind()
        );
        self.inner.tasks.insert(
            (session_id.to_string(), task_id),
            HttpTask {
                plan,
                state: TransportTaskState::Suspended,
                control: None,
            },
        );
        task_id
    }

    fn partial_path(&self) -> PathBuf {
        self.inner
            .config
            .work_dir
            .join(format!("{}.part", Uuid::new_v4()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn attach(&self, session_id: &str, sink: EventSink) -> Result<(), TransportError> {
        self.inner.hub.attach(session_id, sink);
        Ok(())
    }

    async fn detach(&self, session_id: &str) {
        self.inner.hub.detach(session_id);
    }

    async fn create_download_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
    ) -> Result<TaskId, TransportError> {
        let plan = HttpTaskPlan::Download {
            request: request.clone(),
            partial_path: self.partial_path(),
        };
        Ok(self.insert_task(session_id, plan))
    }

    async fn create_download_task_with_resume_data(
        &self,
        session_id: &str,
        resume_data: &[u8],
    ) -> Result<TaskId, TransportError> {
        let checkpoint = ResumeCheckpoint::parse(resume_data)?;
        if !checkpoint.partial_path.exists() {
            warn!(
                "断点文件已不存在，将重新下载: {:?}",
                checkpoint.partial_path
            );
        }

        let plan = HttpTaskPlan::Download {
            request: checkpoint.request,
            partial_path: checkpoint.partial_path,
        };
        Ok(self.insert_task(session_id, plan))
    }

    async fn create_upload_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
        source: &Path,
    ) -> Result<TaskId, TransportError> {
        let plan = HttpTaskPlan::Upload {
            request: request.clone(),
            source: source.to_path_buf(),
        };
        Ok(self.insert_task(session_id, plan))
    }

    async fn create_data_task(
        &self,
        session_id: &str,
        request: &TransferRequest,
    ) -> Result<TaskId, TransportError> {
        let plan = HttpTaskPlan::Data {
            request: request.clone(),
        };
        Ok(self.insert_task(session_id, plan))
    }

    async fn resume_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError> {
        let key = (session_id.to_string(), task_id);
        let (plan, generation, token, stop) = {
            let mut task = self
                .inner
                .tasks
                .get_mut(&key)
                .ok_or_else(|| TransportError::task_not_found(session_id, task_id))?;

            match task.state {
                TransportTaskState::Running => return Ok(()),
                TransportTaskState::Canceling | TransportTaskState::Completed => {
                    return Err(TransportError::task_not_found(session_id, task_id));
                }
                TransportTaskState::Suspended => {}
            }

            let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
            let token = CancellationToken::new();
            let stop = Arc::new(Mutex::new(StopReason::None));

            task.state = TransportTaskState::Running;
            task.control = Some(TaskControl {
                generation,
                token: token.clone(),
                stop: Arc::clone(&stop),
            });
            (task.plan.clone(), generation, token, stop)
        };

        tokio::spawn(run_task(
            Arc::clone(&self.inner),
            session_id.to_string(),
            task_id,
            plan,
            generation,
            token,
            stop,
        ));
        Ok(())
    }

    async fn suspend_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError> {
        let mut task = self
            .inner
            .tasks
            .get_mut(&(session_id.to_string(), task_id))
            .ok_or_else(|| TransportError::task_not_found(session_id, task_id))?;

        match task.state {
            TransportTaskState::Running => {
                task.state = TransportTaskState::Suspended;
                if let Some(control) = task.control.take() {
                    *control.stop.lock() = StopReason::Suspend;
                    control.token.cancel();
                }
                Ok(())
            }
            TransportTaskState::Suspended => Ok(()),
            _ => Err(TransportError::task_not_found(session_id, task_id)),
        }
    }

    async fn cancel_task(&self, session_id: &str, task_id: TaskId) -> Result<(), TransportError> {
        let key = (session_id.to_string(), task_id);
        let completion = {
            let mut task = self
                .inner
                .tasks
                .get_mut(&key)
                .ok_or_else(|| TransportError::task_not_found(session_id, task_id))?;

            match task.state {
                TransportTaskState::Completed | TransportTaskState::Canceling => {
                    return Err(TransportError::task_not_found(session_id, task_id));
                }
                TransportTaskState::Running => {
                    task.state = TransportTaskState::Canceling;
                    if let Some(control) = &task.control {
                        *control.stop.lock() = StopReason::Cancel;
                        control.token.cancel();
                    }
                    None
                }
                TransportTaskState::Suspended => {
                    // 没有运行中的请求，直接结束
                    task.state = TransportTaskState::Completed;
                    Some(TransportCompletion {
                        error: Some(TaskErrorInfo::cancelled()),
                        resume_data: task.plan.checkpoint(),
                        ..Default::default()
                    })
                }
            }
        };

        if let Some(completion) = completion {
            self.inner.tasks.remove(&key);
            self.inner.hub.emit(TransportEvent {
                session_id: session_id.to_string(),
                task_id,
                kind: TransportEventKind::Completed(completion),
            });
        }
        Ok(())
    }

    async fn tasks(&self, session_id: &str) -> Result<Vec<TransportTaskInfo>, TransportError> {
        let mut infos: Vec<TransportTaskInfo> = self
            .inner
            .tasks
            .iter()
            .filter(|entry| {
                entry.key().0 == session_id && entry.state != TransportTaskState::Completed
            })
            .map(|entry| TransportTaskInfo {
                task_id: entry.key().1,
                kind: entry.plan.kind(),
                state: entry.state,
            })
            .collect();
        infos.sort_by_key(|info| info.task_id);
        Ok(infos)
    }
}

// ============================================================================
// 任务执行
// ============================================================================

async fn run_task(
    inner: Arc<HttpInner>,
    session_id: String,
    task_id: TaskId,
    plan: HttpTaskPlan,
    generation: u64,
    token: CancellationToken,
    stop: Arc<Mutex<StopReason>>,
) {
    let emitter = Emitter {
        inner: &*inner,
        session_id: &session_id,
        task_id,
    };

    let result = match &plan {
        HttpTaskPlan::Download {
            request,
            partial_path,
        } => run_download(&emitter, request, partial_path, &token).await,
        HttpTaskPlan::Upload { request, source } => {
            run_upload(&emitter, request, source, &token).await
        }
        HttpTaskPlan::Data { request } => run_data(&emitter, request, &token).await,
    };

    let completion = match result {
        Ok(JobOutcome::Finished(completion)) => Some(completion),
        Ok(JobOutcome::Stopped) => match *stop.lock() {
            StopReason::Suspend => None,
            StopReason::Cancel | StopReason::None => Some(TransportCompletion {
                error: Some(TaskErrorInfo::cancelled()),
                resume_data: plan.checkpoint(),
                ..Default::default()
            }),
        },
        Err(e) => {
            warn!(
                "HTTP 任务失败: session={}, task_id={}, 错误: {}",
                session_id, task_id, e
            );
            Some(TransportCompletion {
                error: Some(TaskErrorInfo::transport(e.to_string())),
                resume_data: plan.checkpoint(),
                ..Default::default()
            })
        }
    };

    let key = (session_id.clone(), task_id);
    let finished = match inner.tasks.get_mut(&key) {
        Some(mut task) => {
            let current = task
                .control
                .as_ref()
                .map_or(false, |c| c.generation == generation);
            if current {
                task.control = None;
            }
            // 已被新一轮运行接管时不改状态，也不上报
            let finished = completion.is_some() && (current || task.control.is_none());
            if finished {
                task.state = TransportTaskState::Completed;
            }
            finished
        }
        None => false,
    };

    let Some(completion) = completion.filter(|_| finished) else {
        return;
    };

    // 结束的任务不再对外可见，移除后再上报
    inner
        .tasks
        .remove_if(&key, |_, task| task.state == TransportTaskState::Completed);
    emitter.emit(TransportEventKind::Completed(completion));
}

struct Emitter<'a> {
    inner: &'a HttpInner,
    session_id: &'a str,
    task_id: TaskId,
}

impl Emitter<'_> {
    fn emit(&self, kind: TransportEventKind) {
        self.inner.hub.emit(TransportEvent {
            session_id: self.session_id.to_string(),
            task_id: self.task_id,
            kind,
        });
    }

    fn progress(&self, bytes_transferred: u64, bytes_expected: Option<u64>) {
        self.emit(TransportEventKind::Progress {
            bytes_transferred,
            bytes_expected,
        });
    }
}

fn build_request(
    client: &Client,
    request: &TransferRequest,
) -> Result<reqwest::RequestBuilder, TransportError> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|e| TransportError::Other(format!("无效的请求方法 {}: {}", request.method, e)))?;

    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    Ok(builder)
}

fn response_metadata(response: &reqwest::Response) -> ResponseMetadata {
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    ResponseMetadata {
        status: response.status().as_u16(),
        url: Some(response.url().to_string()),
        headers,
        expected_content_length: response.content_length(),
    }
}

async fn run_download(
    emitter: &Emitter<'_>,
    request: &TransferRequest,
    partial_path: &Path,
    token: &CancellationToken,
) -> Result<JobOutcome, TransportError> {
    let offset = tokio::fs::metadata(partial_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let mut builder = build_request(&emitter.inner.client, request)?;
    if offset > 0 {
        builder = builder.header(header::RANGE, format!("bytes={}-", offset));
    }

    let response = tokio::select! {
        _ = token.cancelled() => return Ok(JobOutcome::Stopped),
        result = builder.send() => result?,
    };

    let metadata = response_metadata(&response);
    emitter.emit(TransportEventKind::Response(metadata.clone()));

    // 服务器不支持 Range 时从头写
    let append = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let mut file = if append {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(partial_path)
            .await?
    } else {
        tokio::fs::File::create(partial_path).await?
    };

    let mut written = if append { offset } else { 0 };
    let expected = response.content_length().map(|len| len + written);
    let interval = emitter.inner.config.progress_interval();
    let mut last_progress: Option<Instant> = None;

    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                file.flush().await?;
                return Ok(JobOutcome::Stopped);
            }
            chunk = stream.next() => match chunk {
                Some(chunk) => {
                    let bytes = chunk?;
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;

                    if last_progress.map_or(true, |t| t.elapsed() >= interval) {
                        emitter.progress(written, expected);
                        last_progress = Some(Instant::now());
                    }
                }
                None => break,
            }
        }
    }

    file.flush().await?;
    emitter.progress(written, expected);

    Ok(JobOutcome::Finished(TransportCompletion {
        response: Some(metadata),
        location: Some(partial_path.to_path_buf()),
        ..Default::default()
    }))
}

async fn run_upload(
    emitter: &Emitter<'_>,
    request: &TransferRequest,
    source: &Path,
    token: &CancellationToken,
) -> Result<JobOutcome, TransportError> {
    let body = tokio::fs::read(source).await?;
    let total = body.len() as u64;
    emitter.progress(0, Some(total));

    let builder = build_request(&emitter.inner.client, request)?.body(body);
    let response = tokio::select! {
        _ = token.cancelled() => return Ok(JobOutcome::Stopped),
        result = builder.send() => result?,
    };
    emitter.progress(total, Some(total));

    let metadata = response_metadata(&response);
    emitter.emit(TransportEventKind::Response(metadata.clone()));

    let data = tokio::select! {
        _ = token.cancelled() => return Ok(JobOutcome::Stopped),
        result = response.bytes() => result?,
    };

    Ok(JobOutcome::Finished(TransportCompletion {
        response: Some(metadata),
        data: Some(data.to_vec()),
        ..Default::default()
    }))
}

async fn run_data(
    emitter: &Emitter<'_>,
    request: &TransferRequest,
    token: &CancellationToken,
) -> Result<JobOutcome, TransportError> {
    let builder = build_request(&emitter.inner.client, request)?;
    let response = tokio::select! {
        _ = token.cancelled() => return Ok(JobOutcome::Stopped),
        result = builder.send() => result?,
    };

    let metadata = response_metadata(&response);
    emitter.emit(TransportEventKind::Response(metadata.clone()));

    let mut collected = Vec::new();
    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(JobOutcome::Stopped),
            chunk = stream.next() => match chunk {
                Some(chunk) => {
                    let bytes = chunk?;
                    collected.extend_from_slice(&bytes);
                    emitter.emit(TransportEventKind::Data(bytes.to_vec()));
                }
                None => break,
            }
        }
    }

    Ok(JobOutcome::Finished(TransportCompletion {
        response: Some(metadata),
        data: Some(collected),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn transport(dir: &Path) -> HttpTransport {
        HttpTransport::new(HttpConfig {
            work_dir: dir.to_path_buf(),
            ..HttpConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_checkpoint_capture_and_parse() {
        let temp_dir = TempDir::new().unwrap();
        let partial = temp_dir.path().join("a.part");
        std::fs::write(&partial, b"12345").unwrap();

        let request = TransferRequest::get("https://example.com/big.iso");
        let data = ResumeCheckpoint::capture(&request, &partial).unwrap();
        let checkpoint = ResumeCheckpoint::parse(&data).unwrap();

        assert_eq!(checkpoint.request, request);
        assert_eq!(checkpoint.partial_path, partial);
        assert_eq!(checkpoint.bytes_received, 5);

        // 部分文件不存在时不生成断点
        assert!(ResumeCheckpoint::capture(&request, &temp_dir.path().join("missing")).is_none());
    }

    #[tokio::test]
    async fn test_invalid_resume_data() {
        let temp_dir = TempDir::new().unwrap();
        let transport = transport(temp_dir.path());

        assert!(matches!(
            transport
                .create_download_task_with_resume_data("bg", b"garbage")
                .await,
            Err(TransportError::InvalidResumeData(_))
        ));

        let future_version = serde_json::json!({
            "version": 99,
            "request": TransferRequest::get("https://example.com"),
            "partial_path": "/tmp/x.part",
            "bytes_received": 0,
        });
        assert!(transport
            .create_download_task_with_resume_data("bg", future_version.to_string().as_bytes())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_suspended_download_yields_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let transport = transport(temp_dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.attach("bg", tx).await.unwrap();

        let request = TransferRequest::get("https://example.com/file.bin");
        let id = transport.create_download_task("bg", &request).await.unwrap();
        assert_eq!(transport.tasks("bg").await.unwrap().len(), 1);

        // 模拟已下载的部分内容
        let partial = match &transport.inner.tasks.get(&("bg".to_string(), id)).unwrap().plan {
            HttpTaskPlan::Download { partial_path, .. } => partial_path.clone(),
            _ => unreachable!(),
        };
        std::fs::write(&partial, b"half").unwrap();

        transport.cancel_task("bg", id).await.unwrap();
        assert!(transport.tasks("bg").await.unwrap().is_empty());
        assert!(transport.inner.tasks.is_empty());

        let event = rx.recv().await.unwrap();
        let TransportEventKind::Completed(completion) = event.kind else {
            panic!("expected completion");
        };
        assert!(completion.error.unwrap().is_cancelled());

        // 断点可以重建任务
        let resume_data = completion.resume_data.unwrap();
        let resumed = transport
            .create_download_task_with_resume_data("bg", &resume_data)
            .await
            .unwrap();
        assert_ne!(resumed, id);
        assert_eq!(transport.tasks("bg").await.unwrap()[0].task_id, resumed);
        assert_eq!(transport.inner.tasks.len(), 1);

        // 已结束的任务不能再取消
        assert!(matches!(
            transport.cancel_task("bg", id).await,
            Err(TransportError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_method_fails_task() {
        let temp_dir = TempDir::new().unwrap();
        let transport = transport(temp_dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.attach("fg", tx).await.unwrap();

        let request = TransferRequest::new("BAD METHOD", "https://example.com");
        let id = transport.create_data_task("fg", &request).await.unwrap();
        transport.resume_task("fg", id).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, id);
        let TransportEventKind::Completed(completion) = event.kind else {
            panic!("expected completion");
        };
        assert!(completion.error.is_some());
        assert!(completion.resume_data.is_none());
        assert!(transport.tasks("fg").await.unwrap().is_empty());
        assert!(transport.inner.tasks.is_empty());
        assert!(matches!(
            transport.resume_task("fg", id).await,
            Err(TransportError::TaskNotFound { .. })
        ));
    }
}
