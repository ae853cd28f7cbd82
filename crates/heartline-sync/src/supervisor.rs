//! 连接监督器
//!
//! 每个会话至多一条实时通道，由监督器独占持有并负责完整生命周期：
//! 建连 → 心跳 → 断线重连（线性退避）→ 主动断开 / 重试耗尽关闭。
//!
//! 原子性依赖代际（generation）计数：每次 `connect` / `disconnect` 都会在
//! `inner` 锁内把代际加一，所有后台任务（建连、读循环、心跳、重连定时器）
//! 携带自己出生时的代际，任何发射事件或写共享状态的动作都要在同一把锁内
//! 校验代际仍然是当前代。于是 `disconnect()` 返回后旧任务再怎么醒来也无法
//! 产生可见效果，不存在「断开后还收到一条消息」的窗口。
//!
//! 事件通过有界 mpsc 投递给会话循环；缓冲区满时丢弃并记 warn（广播式事件
//! 系统同样是有损语义，会话消息的一致性由缓冲区的按 id 去重兜底）。

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::CredentialProvider;
use crate::config::SyncConfig;
use crate::error::{HeartlineError, Result};
use crate::protocol::{decode_server_frame, encode_client_frame, ClientFrame, ServerFrame};
use crate::transport::{ChannelConnector, FrameSink, FrameStream};

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// 空闲（从未连接）
    Idle,
    /// 建连中（首次、切换绑定或重连定时器到点后拨号）
    Connecting,
    /// 已连接
    Connected,
    /// 断线重连中
    Reconnecting,
    /// 终态：主动断开或重试耗尽后关闭
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "空闲"),
            ChannelState::Connecting => write!(f, "连接中"),
            ChannelState::Connected => write!(f, "已连接"),
            ChannelState::Reconnecting => write!(f, "重连中"),
            ChannelState::Closed => write!(f, "已关闭"),
        }
    }
}

/// 通道事件（监督器 → 会话循环）
#[derive(Debug)]
pub enum ChannelEvent {
    /// 非终态的状态变化
    StateChanged(ChannelState),
    /// 收到一帧服务端协议帧（心跳应答已在监督器内消化，不会出现在这里）
    Frame(ServerFrame),
    /// 终态：重连放弃。一条通道的生命周期内至多投递一次，此后不再有任何事件
    Closed { reason: String },
}

/// 状态快照（内省用）
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub conversation_id: Option<u64>,
    pub state: ChannelState,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

struct SupervisorInner {
    generation: u64,
    conversation_id: Option<u64>,
    state: ChannelState,
    attempts: u32,
    last_error: Option<String>,
    events: Option<mpsc::Sender<ChannelEvent>>,
    cancel: CancellationToken,
}

struct SinkSlot {
    generation: u64,
    sink: Box<dyn FrameSink>,
}

enum PumpOutcome {
    Cancelled,
    Lost(String),
}

/// 投递一条通道事件：缓冲区满则丢弃并记 warn，接收端已关闭则静默
fn deliver(events: &mpsc::Sender<ChannelEvent>, event: ChannelEvent) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => {
            warn!("⚠️ 事件缓冲区已满，丢弃事件: {:?}", event);
        }
    }
}

/// 连接监督器
pub struct ConnectionSupervisor {
    config: SyncConfig,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn ChannelConnector>,
    inner: Mutex<SupervisorInner>,
    // 写端单独放在异步锁里：心跳任务与外部 send_raw 都要跨 await 使用
    sink: tokio::sync::Mutex<Option<SinkSlot>>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SyncConfig,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            credentials,
            connector,
            inner: Mutex::new(SupervisorInner {
                generation: 0,
                conversation_id: None,
                state: ChannelState::Idle,
                attempts: 0,
                last_error: None,
                events: None,
                cancel: CancellationToken::new(),
            }),
            sink: tokio::sync::Mutex::new(None),
        })
    }

    /// 为指定会话建立实时通道
    ///
    /// - 同一会话处于活跃状态时重复调用是幂等的空操作
    /// - 绑定到其他会话时先无声拆除旧通道（等价于 `disconnect`），再建新通道
    /// - 拿不到凭证直接返回 [`HeartlineError::Auth`]，不发起连接、不产生事件
    ///
    /// 事件经 `events` 投递；发送端在终态或 `disconnect` 后被丢弃，
    /// 会话循环以收到 `None` 作为通道结束的标志。
    pub fn connect(
        self: &Arc<Self>,
        conversation_id: u64,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<()> {
        // 凭证同步读取，缺失视为致命错误，连 Connecting 状态都不进入
        let token = self
            .credentials
            .access_token()
            .ok_or_else(|| HeartlineError::Auth("缺少访问令牌，请先登录".to_string()))?;

        let (generation, cancel) = {
            let mut inner = self.inner.lock();

            let active = matches!(
                inner.state,
                ChannelState::Connecting | ChannelState::Connected | ChannelState::Reconnecting
            );
            if inner.conversation_id == Some(conversation_id) && active {
                debug!("会话 {} 的通道已处于 {} 状态，忽略重复 connect", conversation_id, inner.state);
                return Ok(());
            }
            if active {
                info!("🔄 切换会话绑定: {:?} → {}", inner.conversation_id, conversation_id);
            }

            // 翻代：旧任务全部作废
            inner.generation += 1;
            inner.conversation_id = Some(conversation_id);
            inner.state = ChannelState::Connecting;
            inner.attempts = 0;
            inner.last_error = None;
            inner.cancel.cancel();
            inner.cancel = CancellationToken::new();
            inner.events = Some(events);

            if let Some(sender) = &inner.events {
                deliver(sender, ChannelEvent::StateChanged(ChannelState::Connecting));
            }
            (inner.generation, inner.cancel.clone())
        };

        info!("📡 开始连接会话 {} 的实时通道 (generation={})", conversation_id, generation);

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.run_channel(generation, conversation_id, token, cancel).await;
        });
        Ok(())
    }

    /// 主动断开并解除会话绑定
    ///
    /// 返回后保证：状态落在终态 `Closed`、不再投递任何事件、所有定时器
    /// 失效、通道写端已关闭。主动断开不产生 `Closed` 事件（那是重试耗尽
    /// 的终态通知）。
    pub async fn disconnect(&self) {
        let cancel = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.conversation_id = None;
            inner.state = ChannelState::Closed;
            inner.attempts = 0;
            inner.events = None;
            std::mem::replace(&mut inner.cancel, CancellationToken::new())
        };
        cancel.cancel();

        // 翻代之后槽里的写端必然是旧代，直接关闭
        let mut slot = self.sink.lock().await;
        if let Some(mut stale) = slot.take() {
            stale.sink.close().await;
        }
        debug!("⏹️ 通道已断开");
    }

    /// 通过实时通道发送一帧
    ///
    /// 仅在 `Connected` 状态投递；其余状态返回 `false`，由调用方决定走回退通道
    pub async fn send_raw(&self, frame: &ClientFrame) -> bool {
        if self.state() != ChannelState::Connected {
            debug!("实时通道不可用（{}），跳过直发", self.state());
            return false;
        }
        let text = match encode_client_frame(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("⚠️ 帧编码失败: {}", e);
                return false;
            }
        };

        let mut slot = self.sink.lock().await;
        let current = self.inner.lock().generation;
        match slot.as_mut() {
            Some(s) if s.generation == current => match s.sink.send_text(text).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("实时通道发送失败: {}", e);
                    false
                }
            },
            _ => false,
        }
    }

    /// 当前状态
    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// 是否已连接
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// 状态快照
    pub fn snapshot(&self) -> ChannelSnapshot {
        let inner = self.inner.lock();
        ChannelSnapshot {
            conversation_id: inner.conversation_id,
            state: inner.state,
            reconnect_attempts: inner.attempts,
            last_error: inner.last_error.clone(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    /// 代际一致时发射事件；缓冲区满则丢弃并记 warn
    fn emit_if_current(&self, generation: u64, event: ChannelEvent) {
        let inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if let Some(events) = &inner.events {
            deliver(events, event);
        }
    }

    /// 代际一致时切换状态并广播；返回 false 表示本任务已是旧代
    fn transition_if_current(&self, generation: u64, state: ChannelState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.state = state;
        if state == ChannelState::Connected {
            inner.attempts = 0;
            inner.last_error = None;
        }
        if let Some(events) = &inner.events {
            deliver(events, ChannelEvent::StateChanged(state));
        }
        true
    }

    /// 进入终态并投递唯一一次 `Closed` 事件
    fn give_up_if_current(&self, generation: u64, reason: String) {
        let events = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ChannelState::Closed;
            inner.last_error = Some(reason.clone());
            // 摘除发送端：终态之后不会再有任何事件
            inner.events.take()
        };
        warn!("❌ 实时通道关闭: {}", reason);
        if let Some(events) = events {
            if events.try_send(ChannelEvent::Closed { reason }).is_err() {
                warn!("⚠️ 事件缓冲区已满，终态事件未能投递");
            }
        }
    }

    /// 记一次失败。未到上限则进入 Reconnecting 并返回等待时长，否则进入终态
    fn schedule_retry_or_give_up(&self, generation: u64, reason: String) -> Option<std::time::Duration> {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return None;
            }
            if inner.attempts < self.config.reconnect.max_attempts {
                inner.attempts += 1;
                let attempt = inner.attempts;
                inner.state = ChannelState::Reconnecting;
                inner.last_error = Some(reason.clone());
                if let Some(events) = &inner.events {
                    deliver(events, ChannelEvent::StateChanged(ChannelState::Reconnecting));
                }
                let delay = self.config.reconnect.delay_for(attempt);
                info!(
                    "🔄 连接丢失（{}），第 {}/{} 次重连将在 {:?} 后发起",
                    reason, attempt, self.config.reconnect.max_attempts, delay
                );
                return Some(delay);
            }
        }
        self.give_up_if_current(
            generation,
            format!("重连 {} 次均失败，放弃: {}", self.config.reconnect.max_attempts, reason),
        );
        None
    }

    async fn install_sink(&self, generation: u64, sink: Box<dyn FrameSink>) -> bool {
        let mut slot = self.sink.lock().await;
        if !self.is_current(generation) {
            // 旧代连接：丢弃即关闭
            return false;
        }
        *slot = Some(SinkSlot { generation, sink });
        true
    }

    async fn clear_sink(&self, generation: u64) {
        let mut slot = self.sink.lock().await;
        if matches!(slot.as_ref(), Some(s) if s.generation == generation) {
            if let Some(mut stale) = slot.take() {
                stale.sink.close().await;
            }
        }
    }

    async fn send_heartbeat(&self, generation: u64, text: String) -> bool {
        let mut slot = self.sink.lock().await;
        match slot.as_mut() {
            Some(s) if s.generation == generation => s.sink.send_text(text).await.is_ok(),
            _ => false,
        }
    }

    /// 连接任务主循环：建连 → 泵帧，失败后按线性退避重试
    async fn run_channel(
        self: Arc<Self>,
        generation: u64,
        conversation_id: u64,
        token: String,
        cancel: CancellationToken,
    ) {
        loop {
            let url = self.config.channel_url(conversation_id, &token);
            let connect_result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.connector.connect(&url) => result,
            };

            let reason = match connect_result {
                Ok((sink, stream)) => {
                    if !self.install_sink(generation, sink).await {
                        return;
                    }
                    if !self.transition_if_current(generation, ChannelState::Connected) {
                        self.clear_sink(generation).await;
                        return;
                    }
                    info!("✅ 会话 {} 实时通道已建立", conversation_id);

                    let outcome = self.pump(generation, stream, &cancel).await;
                    self.clear_sink(generation).await;
                    match outcome {
                        PumpOutcome::Cancelled => return,
                        PumpOutcome::Lost(reason) => reason,
                    }
                }
                Err(e) => e.to_string(),
            };

            match self.schedule_retry_or_give_up(generation, reason) {
                None => return,
                Some(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // 定时器到点：回到建连状态再重新拨号
                    if !self.transition_if_current(generation, ChannelState::Connecting) {
                        return;
                    }
                }
            }
        }
    }

    /// 已连接状态下的心跳与读循环
    async fn pump(
        &self,
        generation: u64,
        mut stream: Box<dyn FrameStream>,
        cancel: &CancellationToken,
    ) -> PumpOutcome {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return PumpOutcome::Cancelled,
                _ = heartbeat.tick() => {
                    let Ok(text) = encode_client_frame(&ClientFrame::Ping) else { continue };
                    if !self.send_heartbeat(generation, text).await {
                        return PumpOutcome::Lost("心跳发送失败".to_string());
                    }
                }
                frame = stream.next_text() => {
                    match frame {
                        Ok(Some(text)) => match decode_server_frame(&text) {
                            // 心跳应答无需处理
                            Ok(ServerFrame::Pong) => {}
                            Ok(frame) => self.emit_if_current(generation, ChannelEvent::Frame(frame)),
                            // 协议错误：丢帧记日志，连接保持
                            Err(e) => warn!("⚠️ 丢弃无法解析的帧: {}", e),
                        },
                        Ok(None) => return PumpOutcome::Lost("对端关闭连接".to_string()),
                        Err(e) => return PumpOutcome::Lost(e.to_string()),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ConnectionSupervisor")
            .field("conversation_id", &snapshot.conversation_id)
            .field("state", &snapshot.state)
            .field("reconnect_attempts", &snapshot.reconnect_attempts)
            .finish()
    }
}
