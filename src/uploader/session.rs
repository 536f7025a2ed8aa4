// 单文件上传会话
//
// 会话驱动一个文件从开始到终态：
// 1. 解析目标路径、签发凭证
// 2. 读取进度记录（文件大小不一致则丢弃），生成分片计划
// 3. 预分配 / 准备目标对象
// 4. 按分片顺序调度传输，跳过已完成的分片
// 5. 全部完成后提交，删除进度记录
//
// 分片传输在 JoinSet 中并发执行，完成结果只在调度任务中处理，
// 进度记录只有一个写入者。暂停和取消只在派发下一个分片前检查，
// 已派发的传输不会被中断，而是等待其结束后再退出。

use super::chunk::{Chunk, ChunkPlan};
use super::concurrency::ConcurrencyController;
use super::credential::{AccessToken, CredentialBroker, TokenKeeper};
use super::events::{EventSink, UploadEvent};
use crate::config::UploaderConfig;
use crate::error::{UploadError, UploadResult};
use crate::persistence::{progress_key, ProgressRecord, ProgressStore};
use crate::storage::StorageBackend;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 速度单位换算（MB/s）
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// 待上传的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// 文件名（会话、进度记录和事件的标识）
    pub name: String,
    /// 本地路径
    pub path: PathBuf,
    /// 文件大小
    pub size: u64,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size,
        }
    }

    /// 从本地路径创建，文件名取路径最后一段
    pub async fn from_path(path: impl Into<PathBuf>) -> UploadResult<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                UploadError::Config(format!("无法从路径获取文件名: {:?}", path))
            })?;

        Ok(Self {
            name,
            path,
            size: metadata.len(),
        })
    }
}

/// 目标路径解析接口（外部协作者）
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve(&self, file_name: &str) -> Result<String>;
}

/// 在文件名前加固定前缀的解析器
#[derive(Debug, Clone, Default)]
pub struct PrefixDestinationResolver {
    prefix: String,
}

impl PrefixDestinationResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl DestinationResolver for PrefixDestinationResolver {
    async fn resolve(&self, file_name: &str) -> Result<String> {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            Ok(file_name.to_string())
        } else {
            Ok(format!("{}/{}", prefix, file_name))
        }
    }
}

/// 会话状态
///
/// ```text
/// Idle → InProgress → {Paused, Cancelled, Completed, Failed}
/// Paused → InProgress（恢复）| Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 已创建，未开始
    Idle,
    /// 上传中
    InProgress,
    /// 已暂停
    Paused,
    /// 已取消
    Cancelled,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl SessionState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, InProgress)
                | (Idle, Cancelled)
                | (Idle, Failed)
                | (InProgress, Paused)
                | (InProgress, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Paused, InProgress)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// 一次上传调用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 全部分片完成并已提交
    Completed,
    /// 已暂停（已派发的分片均已结束）
    Paused,
    /// 同名文件的会话正在进行，本次调用未做任何事
    AlreadyInProgress,
}

/// 会话控制（调度任务与管理器共享）
#[derive(Debug)]
pub struct SessionControl {
    state: watch::Sender<SessionState>,
    pause_requested: AtomicBool,
    cancel: CancellationToken,
    cancel_cleanup_claimed: AtomicBool,
}

impl Default for SessionControl {
    fn default() -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            state,
            pause_requested: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            cancel_cleanup_claimed: AtomicBool::new(false),
        }
    }
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 尝试切换状态，不合法的切换返回 false
    pub fn transition(&self, next: SessionState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(previous) = previous {
            debug!("会话状态: {} -> {}", previous, next);
        }
        changed
    }

    /// 请求暂停（仅上传中有效）
    pub fn request_pause(&self) -> bool {
        if self.state() != SessionState::InProgress {
            return false;
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 等待会话离开 `InProgress`
    pub async fn wait_settled(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|state| *state != SessionState::InProgress).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    /// 等待会话进入终态
    ///
    /// 取消的会话在清理（删除目标对象和进度记录）结束后才进入 `Cancelled`
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let terminal = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        terminal
    }

    /// 取得取消清理权，只有第一个调用者返回 true
    fn claim_cancel_cleanup(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        !self.cancel_cleanup_claimed.swap(true, Ordering::SeqCst)
    }
}

/// 会话参数
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub token_renewal_period: Duration,
}

impl From<&UploaderConfig> for SessionSettings {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            min_chunk_size: config.min_chunk_size,
            max_chunk_size: config.max_chunk_size,
            token_renewal_period: config.token_renewal_period(),
        }
    }
}

/// 会话依赖的协作者（所有会话共享）
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn StorageBackend>,
    pub resolver: Arc<dyn DestinationResolver>,
    pub broker: Arc<dyn CredentialBroker>,
    pub store: Arc<dyn ProgressStore>,
    pub events: Arc<EventSink>,
    pub controller: Arc<ConcurrencyController>,
    pub settings: SessionSettings,
}

/// 单个分片任务的结果
struct ChunkOutcome {
    chunk: Chunk,
    elapsed: Duration,
    result: Result<()>,
}

/// 调度循环退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Finished,
    Paused,
    Cancelled,
}

/// 本次运行的目标与凭证（失败 / 取消时清理使用）
#[derive(Default)]
struct Attempt {
    dest: Option<String>,
    keeper: Option<TokenKeeper>,
}

/// 进度跟踪（只在调度任务中修改）
struct ProgressTracker {
    key: String,
    record: ProgressRecord,
    total_chunks: usize,
    file_size: u64,
    /// 已上传字节数（包含恢复的分片）
    uploaded_bytes: u64,
    /// 本次运行传输的字节数
    run_bytes: u64,
    run_started: Instant,
}

/// 本次完成后的进度快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub progress: f64,
    /// MB/s
    pub speed: f64,
    /// 秒
    pub eta: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl ProgressTracker {
    fn new(key: String, record: ProgressRecord, plan: &ChunkPlan) -> Self {
        let uploaded_bytes = plan.bytes_for(&record.uploaded_chunk_indices);
        Self {
            key,
            record,
            total_chunks: plan.total_chunks(),
            file_size: plan.file_size(),
            uploaded_bytes,
            run_bytes: 0,
            run_started: Instant::now(),
        }
    }

    fn is_done(&self, index: usize) -> bool {
        self.record.uploaded_chunk_indices.contains(&index)
    }

    fn completed_count(&self) -> usize {
        self.record.completed_count()
    }

    fn mark_done(&mut self, chunk: &Chunk) {
        if self.record.uploaded_chunk_indices.insert(chunk.index) {
            self.uploaded_bytes += chunk.length;
            self.run_bytes += chunk.length;
        }
        self.record.last_write_time = Utc::now();
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let progress = if self.total_chunks == 0 {
            100.0
        } else {
            round2(100.0 * self.completed_count() as f64 / self.total_chunks as f64)
        };

        let elapsed = self.run_started.elapsed().as_secs_f64().max(0.001);
        let bytes_per_sec = self.run_bytes as f64 / elapsed;
        let remaining = self.file_size.saturating_sub(self.uploaded_bytes) as f64;
        let eta = if bytes_per_sec > 0.0 {
            remaining / bytes_per_sec
        } else {
            0.0
        };

        ProgressSnapshot {
            progress,
            speed: round2(bytes_per_sec / BYTES_PER_MB),
            eta: round2(eta),
        }
    }
}

/// 读取源文件中分片对应的字节
async fn read_chunk(path: &Path, chunk: &Chunk) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("打开源文件失败: {:?}", path))?;
    file.seek(SeekFrom::Start(chunk.offset)).await?;

    let mut data = vec![0u8; usize::try_from(chunk.length)?];
    file.read_exact(&mut data)
        .await
        .with_context(|| format!("读取源文件失败: {:?} @{}+{}", path, chunk.offset, chunk.length))?;
    Ok(data)
}

/// 上传会话
pub struct UploadSession {
    /// 会话 ID（日志关联使用）
    id: String,
    file: UploadFile,
    control: Arc<SessionControl>,
    ctx: SessionContext,
}

impl UploadSession {
    pub fn new(file: UploadFile, ctx: SessionContext) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file,
            control: Arc::new(SessionControl::new()),
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file(&self) -> &UploadFile {
        &self.file
    }

    pub fn control(&self) -> &Arc<SessionControl> {
        &self.control
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    /// 运行会话直到完成、暂停、取消或失败
    ///
    /// 暂停后再次调用会重新读取进度记录，从已完成的分片继续
    pub async fn run(&self) -> UploadResult<UploadOutcome> {
        let name = self.file.name.clone();

        if self.control.is_cancelled() || !self.control.transition(SessionState::InProgress) {
            return match self.control.state() {
                SessionState::Completed => Ok(UploadOutcome::Completed),
                SessionState::Idle | SessionState::InProgress | SessionState::Paused
                    if !self.control.is_cancelled() =>
                {
                    Ok(UploadOutcome::AlreadyInProgress)
                }
                // 另一次运行仍在排空分片，由它负责清理
                SessionState::InProgress => Err(UploadError::UploadCancelled(name)),
                _ => {
                    self.cleanup_cancelled(None, None).await;
                    Err(UploadError::UploadCancelled(name))
                }
            };
        }

        let mut attempt = Attempt::default();
        match self.execute(&mut attempt).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_cancelled() => {
                let token = attempt.keeper.as_ref().map(|k| k.token());
                self.cleanup_cancelled(attempt.dest.as_deref(), token).await;
                Err(e)
            }
            Err(e) => {
                self.cleanup_failed(&attempt, &e).await;
                Err(e)
            }
        }
    }

    async fn execute(&self, attempt: &mut Attempt) -> UploadResult<UploadOutcome> {
        let ctx = &self.ctx;
        let name = self.file.name.as_str();

        let resolved = ctx
            .resolver
            .resolve(name)
            .await
            .map_err(UploadError::DestinationResolve)?;
        let dest: &str = attempt.dest.insert(resolved);

        let keeper = TokenKeeper::issue(
            ctx.broker.as_ref(),
            name,
            ctx.settings.token_renewal_period,
        )
        .await?;
        let keeper = attempt.keeper.insert(keeper);

        let key = progress_key(name);
        let record = self.load_record(&key).await?;

        let plan = ChunkPlan::plan(
            self.file.size,
            ctx.settings.min_chunk_size,
            ctx.settings.max_chunk_size,
        )?;

        let mut record = record.unwrap_or_else(|| ProgressRecord::new(self.file.size, Utc::now()));
        record
            .uploaded_chunk_indices
            .retain(|index| *index < plan.total_chunks());
        let resuming = !record.uploaded_chunk_indices.is_empty();

        ctx.backend
            .prepare(dest, self.file.size, resuming, keeper.token())
            .await
            .map_err(UploadError::Storage)?;

        info!(
            "开始上传: {} -> {} (会话={}, 大小={}, 分片={}x{}, 已完成={}, 后端={})",
            name,
            dest,
            self.id,
            self.file.size,
            plan.total_chunks(),
            plan.chunk_size(),
            record.completed_count(),
            ctx.backend.variant()
        );
        ctx.events.emit(UploadEvent::FileStart {
            file_name: name.to_string(),
            total_chunks: plan.total_chunks(),
        });

        let mut tracker = ProgressTracker::new(key, record, &plan);
        let mut tasks: JoinSet<ChunkOutcome> = JoinSet::new();
        let mut failure: Option<UploadError> = None;
        let mut exit = LoopExit::Finished;

        'dispatch: for chunk in plan.chunks() {
            if tracker.is_done(chunk.index) {
                continue;
            }

            // 本会话的槽位已满时，等待最早结束的传输
            while tasks.len() >= ctx.controller.current_limit() {
                let Some(joined) = tasks.join_next().await else {
                    break;
                };
                if let Err(e) = self.apply_completion(&mut tracker, keeper, joined).await {
                    failure = Some(e);
                    break 'dispatch;
                }
            }

            if self.control.is_cancelled() {
                exit = LoopExit::Cancelled;
                break;
            }
            if self.control.is_pause_requested() {
                exit = LoopExit::Paused;
                break;
            }

            // 全局槽位，等待期间继续处理本会话的完成结果
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = self.control.cancel.cancelled() => break None,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = self.apply_completion(&mut tracker, keeper, joined).await {
                            failure = Some(e);
                            break None;
                        }
                    }
                    permit = ctx.controller.acquire() => break Some(permit),
                }
            };
            let Some(permit) = permit else {
                if failure.is_none() {
                    exit = LoopExit::Cancelled;
                }
                break;
            };

            // 等待槽位可能跨越其他会话的传输，拿到槽位后再检查凭证
            if let Err(e) = keeper.ensure_fresh(ctx.broker.as_ref()).await {
                drop(permit);
                failure = Some(e);
                break;
            }

            let backend = Arc::clone(&ctx.backend);
            let dest = dest.to_string();
            let token = keeper.token().clone();
            let path = self.file.path.clone();
            let chunk = *chunk;
            debug!(
                "[{}] 派发分片 #{} (bytes={}+{})",
                name, chunk.index, chunk.offset, chunk.length
            );
            tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let result = match read_chunk(&path, &chunk).await {
                    Ok(data) => backend.transfer_chunk(&dest, &chunk, &data, &token).await,
                    Err(e) => Err(e),
                };
                ChunkOutcome {
                    chunk,
                    elapsed: started.elapsed(),
                    result,
                }
            });
        }

        // 已派发的传输不中断，等待全部结束
        if !tasks.is_empty() {
            debug!("[{}] 等待 {} 个进行中的分片结束", name, tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = self.apply_completion(&mut tracker, keeper, joined).await {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        if exit == LoopExit::Cancelled || self.control.is_cancelled() {
            return Err(UploadError::UploadCancelled(name.to_string()));
        }

        if exit == LoopExit::Paused {
            self.control.transition(SessionState::Paused);
            // 暂停与取消同时发生时以取消为准
            if self.control.is_cancelled() {
                return Err(UploadError::UploadCancelled(name.to_string()));
            }
            info!(
                "上传已暂停: {} (已完成 {}/{} 个分片)",
                name,
                tracker.completed_count(),
                plan.total_chunks()
            );
            ctx.events.emit(UploadEvent::FilePaused {
                file_name: name.to_string(),
            });
            return Ok(UploadOutcome::Paused);
        }

        if tracker.completed_count() != plan.total_chunks() {
            return Err(UploadError::ChunkingIntegrity(format!(
                "{}: 已完成 {} 个分片，计划 {} 个",
                name,
                tracker.completed_count(),
                plan.total_chunks()
            )));
        }

        keeper.ensure_fresh(ctx.broker.as_ref()).await?;
        ctx.backend
            .finalize(dest, &plan, keeper.token())
            .await
            .map_err(UploadError::Storage)?;

        if let Err(e) = ctx.store.remove(&tracker.key).await {
            warn!("删除进度记录失败: {}, 错误: {:#}", name, e);
        }
        self.control.clear_pause();
        self.control.transition(SessionState::Completed);

        info!(
            "上传完成: {} -> {} (本次传输 {} bytes, 凭证续期 {} 次)",
            name,
            dest,
            tracker.run_bytes,
            keeper.renewals()
        );
        ctx.events.emit(UploadEvent::FileComplete {
            file_name: name.to_string(),
        });
        Ok(UploadOutcome::Completed)
    }

    /// 读取进度记录，文件大小不一致时丢弃
    async fn load_record(&self, key: &str) -> UploadResult<Option<ProgressRecord>> {
        let record = self
            .ctx
            .store
            .get(key)
            .await
            .map_err(UploadError::Progress)?;

        match record {
            Some(record) if !record.matches_size(self.file.size) => {
                warn!(
                    "进度记录与文件大小不一致，丢弃: {} (记录={}, 当前={})",
                    self.file.name, record.file_size, self.file.size
                );
                self.ctx
                    .store
                    .remove(key)
                    .await
                    .map_err(UploadError::Progress)?;
                Ok(None)
            }
            Some(record) => {
                info!(
                    "发现进度记录: {} (已完成 {} 个分片)",
                    self.file.name,
                    record.completed_count()
                );
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// 处理一个分片任务的结果（只在调度任务中调用）
    async fn apply_completion(
        &self,
        tracker: &mut ProgressTracker,
        keeper: &mut TokenKeeper,
        joined: std::result::Result<ChunkOutcome, JoinError>,
    ) -> UploadResult<()> {
        let name = self.file.name.as_str();

        let outcome = joined.map_err(|e| {
            error!("[{}] 分片任务异常退出: {}", name, e);
            UploadError::Storage(anyhow::anyhow!("分片任务异常退出: {}", e))
        })?;
        let chunk = outcome.chunk;

        if let Err(source) = outcome.result {
            error!(
                "[{}] 分片 #{} 传输失败 (bytes={}+{}): {:#}",
                name, chunk.index, chunk.offset, chunk.length, source
            );
            return Err(UploadError::ChunkTransfer {
                index: chunk.index,
                offset: chunk.offset,
                length: chunk.length,
                source,
            });
        }

        tracker.mark_done(&chunk);
        keeper.record_transfer_duration(outcome.elapsed);

        // 取消后记录已被删除，不再写回
        if !self.control.is_cancelled() {
            if let Err(e) = self.ctx.store.set(&tracker.key, &tracker.record).await {
                warn!("[{}] 保存进度失败: {:#}", name, e);
            }
        }

        let snapshot = tracker.snapshot();
        debug!(
            "[{}] 分片 #{} 完成, 进度 {:.2}%, 速度 {:.2} MB/s, 剩余 {:.1}s",
            name, chunk.index, snapshot.progress, snapshot.speed, snapshot.eta
        );
        self.ctx.events.emit(UploadEvent::FileProgress {
            file_name: name.to_string(),
            progress: snapshot.progress,
            speed: snapshot.speed,
            eta: snapshot.eta,
        });
        self.ctx.controller.record_sample(snapshot.speed);
        Ok(())
    }

    /// 取消后的清理：删除目标对象和进度记录
    ///
    /// 只有取得清理权的一方执行，清理结束后才切换到 `Cancelled`
    async fn cleanup_cancelled(&self, dest: Option<&str>, token: Option<&AccessToken>) {
        if !self.control.claim_cancel_cleanup() {
            return;
        }
        let name = self.file.name.as_str();

        let target = match (dest, token) {
            (Some(dest), Some(token)) => Some((dest.to_string(), token.clone())),
            _ => self.resolve_for_cleanup().await,
        };
        if let Some((dest, token)) = target {
            if let Err(e) = self.ctx.backend.delete(&dest, &token).await {
                warn!("取消后删除目标对象失败: {} -> {}, 错误: {:#}", name, dest, e);
            }
        }

        if let Err(e) = self.ctx.store.remove(&progress_key(name)).await {
            warn!("取消后删除进度记录失败: {}, 错误: {:#}", name, e);
        }

        self.control.transition(SessionState::Cancelled);
        info!("上传已取消: {}", name);
        self.ctx.events.emit(UploadEvent::FileCancelled {
            file_name: name.to_string(),
        });
    }

    /// 取消未在运行的会话（空闲或已暂停）
    pub(crate) async fn discard(&self) {
        self.control.cancel();
        self.cleanup_cancelled(None, None).await;
    }

    async fn resolve_for_cleanup(&self) -> Option<(String, AccessToken)> {
        let name = self.file.name.as_str();
        let dest = match self.ctx.resolver.resolve(name).await {
            Ok(dest) => dest,
            Err(e) => {
                warn!("清理时解析目标路径失败: {}, 错误: {:#}", name, e);
                return None;
            }
        };
        match self.ctx.broker.issue(Some(name)).await {
            Ok(token) => Some((dest, token)),
            Err(e) => {
                warn!("清理时签发凭证失败: {}, 错误: {:#}", name, e);
                None
            }
        }
    }

    /// 失败后的清理：删除目标对象，保留进度记录
    async fn cleanup_failed(&self, attempt: &Attempt, err: &UploadError) {
        let name = self.file.name.as_str();
        error!("上传失败: {} [{}]: {}", name, err.kind(), err);

        self.ctx.events.emit(UploadEvent::Error {
            file_name: name.to_string(),
            error: err.to_string(),
        });

        if let (Some(dest), Some(keeper)) = (attempt.dest.as_deref(), attempt.keeper.as_ref()) {
            if let Err(e) = self.ctx.backend.delete(dest, keeper.token()).await {
                warn!("失败后删除目标对象失败: {} -> {}, 错误: {:#}", name, dest, e);
            }
        }

        self.control.transition(SessionState::Failed);
    }
}
