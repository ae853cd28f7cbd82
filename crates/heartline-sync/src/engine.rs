//! 同步引擎 —— SDK 主入口
//!
//! 分层架构：
//! ```text
//! SyncEngine (门面)
//!   ├── ConnectionSupervisor (实时通道生命周期)
//!   ├── HistoryLoader (历史分页装载)
//!   ├── OutboundDispatcher (出站双路径)
//!   ├── UnreadLedger (未读账本，持久化)
//!   ├── NotificationLog (通知日志，持久化)
//!   └── EventBus (对外事件广播)
//! ```
//!
//! 引擎是显式构造、显式注入的实例，不做进程级单例：凭证、传输、API、
//! 存储都经 [`SyncEngineBuilder`] 注入，测试里可以同时起多个互不干扰的
//! 引擎。宿主打开会话得到 [`ConversationSession`] 句柄，通过句柄收发消息；
//! UI 层订阅 [`EventBus`] 驱动界面刷新。

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{HttpMessagingClient, MessagingApi};
use crate::auth::CredentialProvider;
use crate::config::SyncConfig;
use crate::dispatcher::{OutboundDispatcher, SendOutcome};
use crate::entities::{ChatMessage, ConversationSummary};
use crate::error::{HeartlineError, Result};
use crate::events::{ConversationEvents, EventBus, EventStats, SyncEvent};
use crate::history::HistoryLoader;
use crate::notifications::NotificationLog;
use crate::protocol::ServerFrame;
use crate::storage::{DurableStore, SledStore};
use crate::supervisor::{
    ChannelEvent, ChannelSnapshot, ChannelState, ConnectionSupervisor,
};
use crate::transcript::{LiveOutcome, TranscriptBuffer};
use crate::transport::{ChannelConnector, WebSocketConnector};
use crate::unread::{UnreadDelta, UnreadLedger};
use crate::version::SDK_VERSION;

/// 引擎构建器
///
/// 凭证必须注入；其余部件缺省时按配置构造默认实现
/// （WebSocket 传输、reqwest API 客户端、sled 存储）。
pub struct SyncEngineBuilder {
    config: SyncConfig,
    credentials: Option<Arc<dyn CredentialProvider>>,
    connector: Option<Arc<dyn ChannelConnector>>,
    api: Option<Arc<dyn MessagingApi>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            credentials: None,
            connector: None,
            api: None,
            store: None,
        }
    }

    /// 注入凭证提供者（必填）
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// 注入实时通道连接器（缺省为 WebSocket）
    pub fn connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// 注入消息 API（缺省为 reqwest HTTP 客户端）
    pub fn api(mut self, api: Arc<dyn MessagingApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// 注入持久化后端（缺省为 `data_dir` 下的 sled）
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 构建引擎并从磁盘恢复持久化状态
    pub async fn build(self) -> Result<Arc<SyncEngine>> {
        let config = self.config;
        config.validate()?;
        let credentials = self.credentials.ok_or_else(|| {
            HeartlineError::Config("缺少凭证提供者，请通过 credentials() 注入".to_string())
        })?;

        info!("🚀 正在初始化同步引擎 v{}...", SDK_VERSION);

        // === 第1层：持久化存储 ===
        let store: Arc<dyn DurableStore> = match self.store {
            Some(store) => store,
            None => SledStore::open(Path::new(&config.data_dir), config.user_id).await?,
        };

        // === 第2层：未读账本与通知日志（重启恢复，不重算）===
        let ledger = UnreadLedger::new(Arc::clone(&store), &config);
        ledger.restore().await?;
        let notifications = NotificationLog::new(Arc::clone(&store));
        notifications.restore().await?;

        // === 第3层：消息 API ===
        let api: Arc<dyn MessagingApi> = match self.api {
            Some(api) => api,
            None => Arc::new(HttpMessagingClient::new(&config, Arc::clone(&credentials))?),
        };

        // === 第4层：实时通道监督器 ===
        let connector: Arc<dyn ChannelConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new(config.connect_timeout())),
        };
        let supervisor = ConnectionSupervisor::new(config.clone(), credentials, connector);

        // === 第5层：历史装载与出站调度 ===
        let history = HistoryLoader::new(Arc::clone(&api), &config);
        let dispatcher = OutboundDispatcher::new(Arc::clone(&supervisor), Arc::clone(&api));

        // === 第6层：事件广播 ===
        let events = EventBus::new(config.event_buffer_size);

        info!(
            "✅ 同步引擎初始化完成 (user_id={}, 未读总数={})",
            config.user_id,
            ledger.aggregate_unread()
        );

        Ok(Arc::new(SyncEngine {
            config,
            api,
            store,
            supervisor,
            history,
            dispatcher,
            ledger,
            notifications,
            events,
        }))
    }
}

/// 会话同步引擎
pub struct SyncEngine {
    config: SyncConfig,
    api: Arc<dyn MessagingApi>,
    store: Arc<dyn DurableStore>,
    supervisor: Arc<ConnectionSupervisor>,
    history: HistoryLoader,
    dispatcher: OutboundDispatcher,
    ledger: Arc<UnreadLedger>,
    notifications: Arc<NotificationLog>,
    events: Arc<EventBus>,
}

impl SyncEngine {
    /// 创建构建器
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    /// 打开会话：建立实时通道、装载初始历史、启动事件循环
    ///
    /// - 凭证缺失返回 [`HeartlineError::Auth`]，不产生任何状态变化
    /// - 初始历史装载失败只发 [`SyncEvent::HistoryLoadFailed`]，会话照常
    ///   打开（记录为空，实时消息仍会流入），不自动重试
    /// - 同一引擎同时只有一条活跃通道；对另一会话再次调用会把通道
    ///   切换过去，旧会话句柄随之静默
    pub async fn open_conversation(self: &Arc<Self>, conversation_id: u64) -> Result<ConversationSession> {
        info!("📖 打开会话 {}", conversation_id);

        let (tx, rx) = mpsc::channel(self.config.event_buffer_size);
        self.supervisor.connect(conversation_id, tx)?;

        let transcript = Arc::new(Mutex::new(TranscriptBuffer::new(
            conversation_id,
            self.config.user_id,
            self.config.optimistic_match_window_ms,
        )));

        // 通道建连与历史装载并行推进；装载期间到达的通道事件
        // 先积压在 rx 里，事件循环启动后按序消化
        match self.history.load_latest(conversation_id).await {
            Ok(page) => {
                let received: Vec<(u64, u64)> =
                    page.messages.iter().map(|m| (m.id, m.sender_id)).collect();
                let count = received.len();
                let has_more = page.has_more;
                transcript.lock().load_initial(page.messages);

                // 初始页同样计入未读账本：已计过数的 id 被环挡掉，
                // 重启后重放同一页不会重复累计
                let mut last_delta = None;
                for (message_id, sender_id) in received {
                    let is_self = sender_id == self.config.user_id;
                    if let Some(delta) = self
                        .ledger
                        .on_message_received(conversation_id, message_id, is_self)
                        .await
                    {
                        last_delta = Some(delta);
                    }
                }
                if let Some(delta) = last_delta {
                    self.emit_unread(delta);
                }
                self.events.emit(SyncEvent::HistoryLoaded {
                    conversation_id,
                    count,
                    has_more,
                });
                info!("📚 初始历史装载完成: 会话 {} 共 {} 条", conversation_id, count);
            }
            Err(e) => {
                warn!("⚠️ 初始历史装载失败（会话仍可收发）: {}", e);
                self.events.emit(SyncEvent::HistoryLoadFailed {
                    conversation_id,
                    reason: e.to_string(),
                });
            }
        }

        let loop_handle = tokio::spawn(Arc::clone(self).run_session_loop(
            conversation_id,
            Arc::clone(&transcript),
            rx,
        ));

        Ok(ConversationSession {
            conversation_id,
            engine: Arc::clone(self),
            transcript,
            loop_handle,
        })
    }

    /// 拉取会话列表
    ///
    /// `server_unread` 是服务端口径的未读数，原样透传；与本地账本
    /// （[`Self::unread_for`]）各自独立，不自动合并
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        let dtos = self.api.list_conversations().await?;
        debug!("会话列表拉取完成: {} 个会话", dtos.len());
        Ok(dtos.into_iter().map(|dto| dto.into_summary()).collect())
    }

    /// 订阅全量事件流
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// 订阅单个会话的事件流
    pub fn subscribe_conversation(&self, conversation_id: u64) -> ConversationEvents {
        self.events.subscribe_conversation(conversation_id)
    }

    /// 事件统计
    pub fn event_stats(&self) -> EventStats {
        self.events.stats()
    }

    /// 所有会话的未读总数
    pub fn aggregate_unread(&self) -> u64 {
        self.ledger.aggregate_unread()
    }

    /// 某会话的未读数
    pub fn unread_for(&self, conversation_id: u64) -> u32 {
        self.ledger.unread_for(conversation_id)
    }

    /// 各会话未读数快照（只含非零项）
    pub fn unread_snapshot(&self) -> Vec<(u64, u32)> {
        self.ledger.snapshot()
    }

    /// 通知日志
    pub fn notifications(&self) -> Arc<NotificationLog> {
        Arc::clone(&self.notifications)
    }

    /// 实时通道状态快照（内省用）
    pub fn channel_snapshot(&self) -> ChannelSnapshot {
        self.supervisor.snapshot()
    }

    /// 当前配置
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 退出前调用：断开实时通道并把持久化状态刷到磁盘
    pub async fn shutdown(&self) {
        self.supervisor.disconnect().await;
        if let Err(e) = self.store.flush().await {
            warn!("⚠️ 关闭时刷写存储失败: {}", e);
        }
        info!("⏹️ 同步引擎已关闭");
    }

    /// 会话事件循环：把通道事件翻译成对外的同步事件
    ///
    /// 监督器在终态或 `disconnect` 后丢弃事件发送端，`recv` 返回 `None`，
    /// 循环随之退出——不需要额外的停止信号。
    async fn run_session_loop(
        self: Arc<Self>,
        conversation_id: u64,
        transcript: Arc<Mutex<TranscriptBuffer>>,
        mut rx: mpsc::Receiver<ChannelEvent>,
    ) {
        // 掉线期间服务端可能落了新消息而广播已丢失，恢复后拉最新页补洞
        let mut gap_repair_armed = false;
        while let Some(event) = rx.recv().await {
            match event {
                ChannelEvent::StateChanged(state) => {
                    self.events.emit(SyncEvent::ConnectionChanged {
                        conversation_id,
                        state,
                    });
                    match state {
                        ChannelState::Reconnecting => gap_repair_armed = true,
                        ChannelState::Connected if gap_repair_armed => {
                            gap_repair_armed = false;
                            self.repair_gap(conversation_id, &transcript).await;
                        }
                        _ => {}
                    }
                }
                ChannelEvent::Frame(frame) => {
                    self.handle_frame(conversation_id, &transcript, frame).await;
                }
                ChannelEvent::Closed { reason } => {
                    warn!("❌ 会话 {} 的通道进入终态: {}", conversation_id, reason);
                    self.events.emit(SyncEvent::ConnectionClosed {
                        conversation_id,
                        reason,
                    });
                }
            }
        }
        debug!("会话 {} 的事件循环退出", conversation_id);
    }

    /// 处理一帧服务端协议帧
    async fn handle_frame(
        &self,
        conversation_id: u64,
        transcript: &Arc<Mutex<TranscriptBuffer>>,
        frame: ServerFrame,
    ) {
        match frame {
            ServerFrame::NewMessage { message } => {
                let message_id = message.id;
                let sender_id = message.sender_id;
                let payload = message.clone();
                let outcome = transcript.lock().apply_live(message);
                match outcome {
                    LiveOutcome::Inserted => {
                        let is_self = sender_id == self.config.user_id;
                        if let Some(delta) = self
                            .ledger
                            .on_message_received(conversation_id, message_id, is_self)
                            .await
                        {
                            self.emit_unread(delta);
                        }
                        if !is_self {
                            if let Err(e) = self
                                .notifications
                                .record_message(conversation_id, sender_id, &payload.body)
                                .await
                            {
                                warn!("⚠️ 通知记录失败: {}", e);
                            }
                        }
                        self.events.emit(SyncEvent::MessageReceived {
                            conversation_id,
                            message: payload.into_message(),
                        });
                    }
                    LiveOutcome::ConfirmedOptimistic(local_id) => {
                        self.events.emit(SyncEvent::MessageConfirmed {
                            conversation_id,
                            local_id,
                            server_id: message_id,
                        });
                    }
                    LiveOutcome::Duplicate => {
                        debug!("重复广播已忽略: id={}", message_id);
                    }
                    LiveOutcome::Ignored => {}
                }
            }
            ServerFrame::Error { reason } => {
                warn!("⚠️ 服务端错误通告: {}", reason);
                self.events.emit(SyncEvent::ProtocolError {
                    conversation_id,
                    reason,
                });
            }
            // 心跳应答在监督器内消化，不会走到这里
            ServerFrame::Pong => {}
        }
    }

    /// 重连成功后拉最新一页补洞
    ///
    /// 按行并入会话记录，不整页替换——整页替换会截断用户往前翻出来的
    /// 旧历史。补进来的消息走与实时广播相同的去重、未读与事件路径；
    /// 通知日志只记实时推送，补洞不补通知。
    async fn repair_gap(&self, conversation_id: u64, transcript: &Arc<Mutex<TranscriptBuffer>>) {
        let page = match self.history.load_latest(conversation_id).await {
            Ok(page) => page,
            Err(e) => {
                warn!("⚠️ 重连补洞失败: {}", e);
                self.events.emit(SyncEvent::HistoryLoadFailed {
                    conversation_id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let mut fresh = 0usize;
        let mut last_delta = None;
        for message in page.messages {
            let message_id = message.id;
            let sender_id = message.sender_id;
            let payload = message.clone();
            let outcome = transcript.lock().apply_live(message);
            match outcome {
                LiveOutcome::Inserted => {
                    fresh += 1;
                    let is_self = sender_id == self.config.user_id;
                    if let Some(delta) = self
                        .ledger
                        .on_message_received(conversation_id, message_id, is_self)
                        .await
                    {
                        last_delta = Some(delta);
                    }
                    self.events.emit(SyncEvent::MessageReceived {
                        conversation_id,
                        message: payload.into_message(),
                    });
                }
                LiveOutcome::ConfirmedOptimistic(local_id) => {
                    self.events.emit(SyncEvent::MessageConfirmed {
                        conversation_id,
                        local_id,
                        server_id: message_id,
                    });
                }
                LiveOutcome::Duplicate | LiveOutcome::Ignored => {}
            }
        }
        if let Some(delta) = last_delta {
            self.emit_unread(delta);
        }
        if fresh > 0 {
            info!("🔄 重连补洞完成: 会话 {} 补进 {} 条", conversation_id, fresh);
        }
    }

    fn emit_unread(&self, delta: UnreadDelta) {
        self.events.emit(SyncEvent::UnreadChanged {
            conversation_id: delta.conversation_id,
            conversation_unread: delta.conversation_unread,
            aggregate_unread: delta.aggregate_unread,
        });
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("user_id", &self.config.user_id)
            .field("channel", &self.supervisor.snapshot())
            .finish()
    }
}

/// 单个会话的操作句柄
///
/// 由 [`SyncEngine::open_conversation`] 创建，持有会话记录缓冲区与事件
/// 循环任务。读操作是同步快照；写操作走引擎的调度与账本。`close()`
/// 消费句柄，拆除通道并等事件循环退出。
pub struct ConversationSession {
    conversation_id: u64,
    engine: Arc<SyncEngine>,
    transcript: Arc<Mutex<TranscriptBuffer>>,
    loop_handle: JoinHandle<()>,
}

impl ConversationSession {
    pub fn conversation_id(&self) -> u64 {
        self.conversation_id
    }

    /// 会话记录快照（已按时间排好序）
    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.transcript.lock().messages().to_vec()
    }

    /// 本会话的通道状态；通道已切换到其他会话时报告 `Idle`
    pub fn connection_state(&self) -> ChannelState {
        let snapshot = self.engine.supervisor.snapshot();
        if snapshot.conversation_id == Some(self.conversation_id) {
            snapshot.state
        } else {
            ChannelState::Idle
        }
    }

    /// 本会话的未读数
    pub fn unread(&self) -> u32 {
        self.engine.ledger.unread_for(self.conversation_id)
    }

    /// 发送一条消息
    ///
    /// 立即在会话记录里插入乐观条目并返回其创建时的快照（最终状态以
    /// 事件与 [`Self::transcript`] 为准），随后经调度器送出：
    /// - 实时路径成功 → 等服务端回显确认
    /// - 回退路径成功 → 响应即确认，发 [`SyncEvent::MessageConfirmed`]
    /// - 两路都失败 → 条目标记失败，发 [`SyncEvent::MessageSendFailed`]
    ///   并把错误上抛，可用 [`Self::retry_message`] 重试
    pub async fn send_message(&self, body: &str) -> Result<ChatMessage> {
        if body.trim().is_empty() {
            return Err(HeartlineError::SendFailure("消息内容为空".to_string()));
        }

        let local_id = Uuid::new_v4();
        let pending = self.transcript.lock().push_optimistic(local_id, body);
        self.dispatch_pending(local_id, body).await?;
        Ok(pending)
    }

    /// 重试一条发送失败的消息
    ///
    /// 条目回到待确认状态并重新排到记录末尾，再走一遍完整发送路径；
    /// `local_id` 对应的条目不存在或不处于失败状态时报错
    pub async fn retry_message(&self, local_id: Uuid) -> Result<()> {
        let requeued = self
            .transcript
            .lock()
            .requeue_optimistic(local_id)
            .ok_or_else(|| {
                HeartlineError::SendFailure("没有可重试的失败条目".to_string())
            })?;
        info!("🔄 重试失败条目: 会话 {} local_id={}", self.conversation_id, local_id);
        self.dispatch_pending(local_id, &requeued.body).await
    }

    /// 往前翻一页历史，返回是否还有更旧的消息
    ///
    /// 旧页按行并入会话记录（去重由缓冲区兜底）；翻历史不是收新消息，
    /// 不触碰未读账本。装载失败时记录保持原状，不自动重试。
    pub async fn load_older(&self) -> Result<bool> {
        let offset = self.transcript.lock().confirmed_count() as u32;
        let page = match self
            .engine
            .history
            .load_page(self.conversation_id, offset)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.engine.events.emit(SyncEvent::HistoryLoadFailed {
                    conversation_id: self.conversation_id,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let count = page.messages.len();
        {
            let mut transcript = self.transcript.lock();
            for message in page.messages {
                transcript.apply_live(message);
            }
        }
        self.engine.events.emit(SyncEvent::HistoryLoaded {
            conversation_id: self.conversation_id,
            count,
            has_more: page.has_more,
        });
        debug!("📚 翻页装载完成: 会话 {} 新增 {} 条", self.conversation_id, count);
        Ok(page.has_more)
    }

    /// 把本会话标记为已读
    ///
    /// 未读数归零并从总数里扣除；已计过数的消息 id 保持在环里，
    /// 同一条消息不会在之后被再次计数
    pub async fn mark_read(&self) {
        if let Some(delta) = self
            .engine
            .ledger
            .mark_conversation_read(self.conversation_id)
            .await
        {
            self.engine.emit_unread(delta);
        }
    }

    /// 关闭会话：拆除通道、等事件循环退出
    ///
    /// 返回后保证不再有本会话的任何事件。通道已被切换到其他会话时
    /// 只回收事件循环，不动现有通道。
    pub async fn close(self) {
        let bound_here =
            self.engine.supervisor.snapshot().conversation_id == Some(self.conversation_id);
        if bound_here {
            self.engine.supervisor.disconnect().await;
        }
        // disconnect 丢弃事件发送端，循环自然退出
        let _ = self.loop_handle.await;
        info!("📖 会话 {} 已关闭", self.conversation_id);
    }

    /// 乐观条目的统一出站路径（首发与重试共用）
    async fn dispatch_pending(&self, local_id: Uuid, body: &str) -> Result<()> {
        match self
            .engine
            .dispatcher
            .send(self.conversation_id, body, local_id)
            .await
        {
            Ok(SendOutcome::SentLive) => Ok(()),
            Ok(SendOutcome::ConfirmedByFallback(message)) => {
                let server_id = message.id;
                let outcome = self.transcript.lock().confirm_optimistic(local_id, message);
                // 回显可能抢在回退响应之前把条目确认掉，此时这里是 Duplicate
                if matches!(outcome, LiveOutcome::ConfirmedOptimistic(_)) {
                    self.engine.events.emit(SyncEvent::MessageConfirmed {
                        conversation_id: self.conversation_id,
                        local_id,
                        server_id,
                    });
                }
                Ok(())
            }
            Err(e) => {
                self.transcript.lock().mark_failed(local_id);
                self.engine.events.emit(SyncEvent::MessageSendFailed {
                    conversation_id: self.conversation_id,
                    local_id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("conversation_id", &self.conversation_id)
            .field("state", &self.connection_state())
            .finish()
    }
}
