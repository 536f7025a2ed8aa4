// 上传管理器
//
// 按文件名登记会话，提供上传 / 暂停 / 恢复 / 取消入口。
// 所有会话共享同一个并发控制器，存储后端、凭证签发器、进度存储和事件分发器
// 同样在会话之间共享。

use super::concurrency::{ConcurrencyController, NetworkProbe};
use super::credential::CredentialBroker;
use super::events::{EventSink, UploadEvent};
use super::session::{
    DestinationResolver, SessionContext, SessionSettings, SessionState, UploadFile, UploadOutcome,
    UploadSession,
};
use crate::config::UploaderConfig;
use crate::error::{UploadError, UploadResult};
use crate::persistence::{build_progress_store, progress_key, ProgressStore};
use crate::storage::{select_backend, RetryPolicy, StorageBackend, StorageClients};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 上传器的外部协作者
pub struct UploaderDeps {
    pub backend: Arc<dyn StorageBackend>,
    pub resolver: Arc<dyn DestinationResolver>,
    pub broker: Arc<dyn CredentialBroker>,
    pub store: Arc<dyn ProgressStore>,
    pub events: Arc<EventSink>,
    pub probe: Option<Arc<dyn NetworkProbe>>,
}

/// 上传管理器
pub struct Uploader {
    config: UploaderConfig,
    ctx: SessionContext,
    /// 文件名 -> 会话
    sessions: DashMap<String, Arc<UploadSession>>,
    /// 已取消、仍在排空分片的会话，清理结束前同名文件不能开始新会话
    cancelling: DashMap<String, Arc<UploadSession>>,
}

impl Uploader {
    /// 创建上传管理器
    pub fn new(config: UploaderConfig, deps: UploaderDeps) -> UploadResult<Self> {
        config.validate()?;

        let controller = ConcurrencyController::with_probe(
            config.max_concurrent_uploads,
            config.adaptive_concurrency,
            deps.probe.as_deref(),
        );

        info!(
            "创建上传管理器: 存储={}, 默认并发={}, 分片大小={}~{}",
            deps.backend.variant(),
            config.max_concurrent_uploads,
            config.min_chunk_size,
            config.max_chunk_size
        );

        let ctx = SessionContext {
            backend: deps.backend,
            resolver: deps.resolver,
            broker: deps.broker,
            store: deps.store,
            events: deps.events,
            controller,
            settings: SessionSettings::from(&config),
        };

        Ok(Self {
            config,
            ctx,
            sessions: DashMap::new(),
            cancelling: DashMap::new(),
        })
    }

    /// 按配置选择存储后端和进度存储并创建上传管理器
    pub fn with_storage(
        config: UploaderConfig,
        clients: StorageClients,
        resolver: Arc<dyn DestinationResolver>,
        broker: Arc<dyn CredentialBroker>,
        probe: Option<Arc<dyn NetworkProbe>>,
    ) -> UploadResult<Self> {
        let backend = select_backend(
            &config.storage_variant,
            clients,
            RetryPolicy::from(&config.retry),
        )?;
        let store = build_progress_store(&config.progress_store);

        Self::new(
            config,
            UploaderDeps {
                backend,
                resolver,
                broker,
                store,
                events: Arc::new(EventSink::new()),
                probe,
            },
        )
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.ctx.controller
    }

    /// 订阅上传事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        self.ctx.events.subscribe()
    }

    /// 上传单个文件
    ///
    /// 同名文件正在上传时直接返回 `AlreadyInProgress`，已暂停或正在暂停时恢复上传。
    /// 同名文件刚被取消时先等待其清理结束
    pub async fn upload_file(&self, file: UploadFile) -> UploadResult<UploadOutcome> {
        let name = file.name.clone();
        self.wait_cancelled(&name).await;

        let (session, existing) = match self.sessions.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                let current = Arc::clone(entry.get());
                if current.state().is_terminal() {
                    let fresh = Arc::new(UploadSession::new(file, self.ctx.clone()));
                    entry.insert(Arc::clone(&fresh));
                    (fresh, false)
                } else {
                    (current, true)
                }
            }
            Entry::Vacant(entry) => {
                let fresh = Arc::new(UploadSession::new(file, self.ctx.clone()));
                entry.insert(Arc::clone(&fresh));
                (fresh, false)
            }
        };

        if existing {
            if session.state() == SessionState::Paused || session.control().is_pause_requested() {
                return self.resume_session(&session).await;
            }
            info!("文件已在上传中，忽略重复请求: {}", name);
            return Ok(UploadOutcome::AlreadyInProgress);
        }

        self.drive(&session).await
    }

    /// 并发上传多个文件，单个文件失败不影响其他文件
    ///
    /// 结果顺序与输入一致
    pub async fn upload_files(
        &self,
        files: Vec<UploadFile>,
    ) -> Vec<(String, UploadResult<UploadOutcome>)> {
        info!("批量上传 {} 个文件", files.len());

        let uploads = files.into_iter().map(|file| async move {
            let name = file.name.clone();
            let result = self.upload_file(file).await;
            (name, result)
        });
        join_all(uploads).await
    }

    /// 暂停上传，会话不存在或不在上传中时返回 false
    pub fn pause(&self, name: &str) -> bool {
        let Some(session) = self.session(name) else {
            debug!("暂停: 会话不存在 {}", name);
            return false;
        };

        let requested = session.control().request_pause();
        if requested {
            info!("暂停上传: {}", name);
        }
        requested
    }

    /// 恢复已暂停的上传，会话不存在时返回 None
    ///
    /// 暂停尚未生效（仍在等待进行中的分片）时先等待其生效
    pub async fn resume(&self, name: &str) -> Option<UploadResult<UploadOutcome>> {
        let session = self.session(name)?;
        Some(self.resume_session(&session).await)
    }

    /// 取消上传，删除进度记录和会话
    ///
    /// 运行中的会话在派发下一个分片前发现取消标志后自行清理目标对象，
    /// 清理结束前留在取消表中；未在运行的会话（空闲 / 已暂停）在这里直接清理
    pub async fn cancel(&self, name: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(name) else {
            debug!("取消: 会话不存在 {}", name);
            return false;
        };

        session.control().cancel();
        if let Err(e) = self.ctx.store.remove(&progress_key(name)).await {
            warn!("删除进度记录失败: {}, 错误: {:#}", name, e);
        }
        info!("取消上传: {}", name);

        if matches!(session.state(), SessionState::Idle | SessionState::Paused) {
            session.discard().await;
        }
        if !session.state().is_terminal() {
            self.cancelling.insert(name.to_string(), session);
        }
        true
    }

    /// 关闭上传管理器
    ///
    /// 取消所有进行中的会话，停止恢复探测定时器并清空会话表。
    /// 已暂停的会话只从会话表移除，进度记录保留以便之后继续
    pub async fn destroy(&self) {
        let running: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                matches!(
                    entry.value().state(),
                    SessionState::Idle | SessionState::InProgress
                )
            })
            .map(|entry| entry.key().clone())
            .collect();

        for name in &running {
            self.cancel(name).await;
        }

        self.ctx.controller.shutdown();
        self.sessions.clear();
        info!("上传管理器已关闭 (取消 {} 个会话)", running.len());
    }

    /// 查询会话状态
    pub fn state(&self, name: &str) -> Option<SessionState> {
        self.session(name).map(|session| session.state())
    }

    /// 未结束的会话（上传中 / 已暂停），按文件名排序
    pub fn active_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// 等待同名的已取消会话清理结束
    async fn wait_cancelled(&self, name: &str) {
        let Some(stale) = self
            .cancelling
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };

        debug!("等待已取消的会话清理结束: {} (会话={})", name, stale.id());
        stale.control().wait_terminal().await;
        self.cancelling
            .remove_if(name, |_, session| Arc::ptr_eq(session, &stale));
    }

    fn session(&self, name: &str) -> Option<Arc<UploadSession>> {
        self.sessions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    async fn resume_session(&self, session: &Arc<UploadSession>) -> UploadResult<UploadOutcome> {
        let control = session.control();
        let name = session.file().name.as_str();

        if control.state() == SessionState::InProgress {
            if !control.is_pause_requested() {
                return Ok(UploadOutcome::AlreadyInProgress);
            }
            debug!("等待暂停生效: {}", name);
            control.wait_settled().await;
        }

        match control.state() {
            SessionState::Paused => {}
            SessionState::Completed => return Ok(UploadOutcome::Completed),
            SessionState::Cancelled => return Err(UploadError::UploadCancelled(name.to_string())),
            _ => return Ok(UploadOutcome::AlreadyInProgress),
        }

        control.clear_pause();
        info!("恢复上传: {}", name);
        self.ctx.events.emit(UploadEvent::FileResumed {
            file_name: name.to_string(),
        });

        self.drive(session).await
    }

    /// 运行会话，结束（完成 / 取消 / 失败）后移出会话表
    async fn drive(&self, session: &Arc<UploadSession>) -> UploadResult<UploadOutcome> {
        let result = session.run().await;

        let settled = !matches!(
            result,
            Ok(UploadOutcome::Paused) | Ok(UploadOutcome::AlreadyInProgress)
        );
        if settled {
            let name = &session.file().name;
            self.sessions
                .remove_if(name, |_, s| Arc::ptr_eq(s, session));
            self.cancelling
                .remove_if(name, |_, s| Arc::ptr_eq(s, session));
        }
        result
    }
}
