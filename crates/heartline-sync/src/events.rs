//! 事件系统
//!
//! 引擎对外的唯一通知出口：所有组件的变化收敛成 [`SyncEvent`]，经有界
//! broadcast 通道广播给订阅者。订阅关系显式可见：`subscribe()` 拿接收端，
//! 丢掉接收端即退订，没有藏在角落里的回调注册表。
//!
//! 广播是有损的：订阅者消费太慢会收到 `Lagged`，漏掉的用事件里的会话 id
//! 重新拉一次快照即可补齐（会话记录与未读数都以内部状态为准，事件只是提示）。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::entities::ChatMessage;
use crate::supervisor::ChannelState;
use crate::utils::TimeNormalizer;

/// 同步核心事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 通道状态变化（非终态）
    ConnectionChanged {
        conversation_id: u64,
        state: ChannelState,
    },
    /// 通道终止：重试耗尽，需要用户手动触发重连
    ConnectionClosed {
        conversation_id: u64,
        reason: String,
    },
    /// 历史页装载完成，会话记录已更新
    HistoryLoaded {
        conversation_id: u64,
        count: usize,
        has_more: bool,
    },
    /// 历史装载失败（会话记录保持原样，不自动重试）
    HistoryLoadFailed {
        conversation_id: u64,
        reason: String,
    },
    /// 会话记录新增一条已确认消息
    MessageReceived {
        conversation_id: u64,
        message: ChatMessage,
    },
    /// 乐观条目获得服务端确认
    MessageConfirmed {
        conversation_id: u64,
        local_id: Uuid,
        server_id: u64,
    },
    /// 发送失败，对应乐观条目已标记为失败
    MessageSendFailed {
        conversation_id: u64,
        local_id: Uuid,
        reason: String,
    },
    /// 未读数变化
    UnreadChanged {
        conversation_id: u64,
        conversation_unread: u32,
        aggregate_unread: u64,
    },
    /// 服务端协议错误通告（连接保持）
    ProtocolError {
        conversation_id: u64,
        reason: String,
    },
}

impl SyncEvent {
    /// 事件类型字符串（统计与日志用）
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ConnectionChanged { .. } => "connection_changed",
            SyncEvent::ConnectionClosed { .. } => "connection_closed",
            SyncEvent::HistoryLoaded { .. } => "history_loaded",
            SyncEvent::HistoryLoadFailed { .. } => "history_load_failed",
            SyncEvent::MessageReceived { .. } => "message_received",
            SyncEvent::MessageConfirmed { .. } => "message_confirmed",
            SyncEvent::MessageSendFailed { .. } => "message_send_failed",
            SyncEvent::UnreadChanged { .. } => "unread_changed",
            SyncEvent::ProtocolError { .. } => "protocol_error",
        }
    }

    /// 事件所属会话
    pub fn conversation_id(&self) -> u64 {
        match self {
            SyncEvent::ConnectionChanged { conversation_id, .. }
            | SyncEvent::ConnectionClosed { conversation_id, .. }
            | SyncEvent::HistoryLoaded { conversation_id, .. }
            | SyncEvent::HistoryLoadFailed { conversation_id, .. }
            | SyncEvent::MessageReceived { conversation_id, .. }
            | SyncEvent::MessageConfirmed { conversation_id, .. }
            | SyncEvent::MessageSendFailed { conversation_id, .. }
            | SyncEvent::UnreadChanged { conversation_id, .. }
            | SyncEvent::ProtocolError { conversation_id, .. } => *conversation_id,
        }
    }
}

/// 事件统计
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    /// 最后一次发射的 UTC 毫秒时间戳
    pub last_event_at: Option<i64>,
}

/// 事件总线
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
    stats: RwLock<EventStats>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender,
            stats: RwLock::new(EventStats::default()),
        })
    }

    /// 发射一个事件
    ///
    /// 没有订阅者时静默丢弃（无 UI 的后台场景属正常情况）
    pub fn emit(&self, event: SyncEvent) {
        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_at = Some(TimeNormalizer::now_utc_millis());
        }

        debug!("📢 事件: {} (会话 {})", event.event_type(), event.conversation_id());
        if self.sender.send(event).is_err() {
            debug!("事件无人订阅，已丢弃");
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 只订阅某个会话的事件
    pub fn subscribe_conversation(&self, conversation_id: u64) -> ConversationEvents {
        ConversationEvents {
            receiver: self.sender.subscribe(),
            conversation_id,
        }
    }

    /// 活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// 统计快照
    pub fn stats(&self) -> EventStats {
        self.stats.read().clone()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// 按会话过滤的事件接收端
pub struct ConversationEvents {
    receiver: broadcast::Receiver<SyncEvent>,
    conversation_id: u64,
}

impl ConversationEvents {
    /// 接收下一个属于本会话的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.conversation_id() == self.conversation_id {
                return Ok(event);
            }
        }
    }

    /// 非阻塞版本
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if event.conversation_id() == self.conversation_id {
                return Ok(event);
            }
        }
    }
}
