//! 会话消息缓冲区（调和层）
//!
//! 把三股消息流调和成一份有序、无重复的会话记录：
//! - 历史拉取：整批替换已确认内容（仅本地的乐观条目保留）
//! - 实时推送：逐条插入，**只按 server_id 去重**（正文相同的两条消息是两条消息）
//! - 本地乐观条目：立即上屏，等待确认或失败
//!
//! 乐观条目的确认优先用服务端回显的 `client_ref` 精确匹配；回显不带 ref 时退化为
//! 「同发送者 + 同正文 + 有界时间窗口」启发式。时间窗口之外宁可多显示一条，也不
//! 错误吞掉真实消息。
//!
//! 本结构不含锁：每个会话的缓冲区只被其会话循环单线程地读写。

use std::collections::HashSet;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::{ChatMessage, DeliveryStatus};
use crate::protocol::WireMessage;
use crate::utils::TimeNormalizer;

/// 一条实时/历史消息并入缓冲区的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    /// 新消息已按 (时间戳, id) 顺序插入
    Inserted,
    /// server_id 已存在，忽略
    Duplicate,
    /// 确认了一条乐观条目（携带其 local_id）
    ConfirmedOptimistic(Uuid),
    /// 不属于本会话的消息，忽略
    Ignored,
}

/// 会话消息缓冲区
pub struct TranscriptBuffer {
    conversation_id: u64,
    self_id: u64,
    match_window_ms: i64,
    messages: Vec<ChatMessage>,
    confirmed_ids: HashSet<u64>,
}

impl TranscriptBuffer {
    pub fn new(conversation_id: u64, self_id: u64, match_window_ms: i64) -> Self {
        Self {
            conversation_id,
            self_id,
            match_window_ms,
            messages: Vec::new(),
            confirmed_ids: HashSet::new(),
        }
    }

    /// 整批装载历史消息
    ///
    /// 已确认内容被整体替换；尚未确认/已失败的本地条目在替换后保留。
    /// 每一行都走与实时推送相同的并入逻辑，因此重复行、携带 `client_ref`
    /// 的回显行（断线期间确认丢失的场景）都会被正确处理。
    pub fn load_initial(&mut self, batch: Vec<WireMessage>) {
        let locals: Vec<ChatMessage> = self
            .messages
            .drain(..)
            .filter(|m| m.server_id.is_none())
            .collect();
        self.confirmed_ids.clear();
        self.messages = locals;

        for wire in batch {
            self.apply_live(wire);
        }
        debug!(
            "📚 历史装载完成: 会话 {} 共 {} 条（含 {} 条本地未确认）",
            self.conversation_id,
            self.messages.len(),
            self.pending_count()
        );
    }

    /// 并入一条服务端消息（实时推送或历史行）
    pub fn apply_live(&mut self, wire: WireMessage) -> LiveOutcome {
        if wire.conversation_id != self.conversation_id {
            warn!(
                "⚠️ 收到其他会话的消息（期望 {}，实际 {}），忽略",
                self.conversation_id, wire.conversation_id
            );
            return LiveOutcome::Ignored;
        }
        if self.confirmed_ids.contains(&wire.id) {
            return LiveOutcome::Duplicate;
        }

        let server_ts = TimeNormalizer::normalize_or_now(&wire.created_at);

        // 优先按回显的 client_ref 精确匹配乐观条目
        if let Some(ref_id) = wire.client_ref {
            if let Some(index) = self.find_pending_by_local_id(ref_id) {
                return self.promote_at(index, wire.id, server_ts);
            }
        }

        // 回显不带 ref：同发送者 + 同正文 + 时间窗口内的启发式匹配
        if wire.sender_id == self.self_id {
            if let Some(index) = self.messages.iter().position(|m| {
                m.status == DeliveryStatus::Pending
                    && m.sender_id == wire.sender_id
                    && m.body == wire.body
                    && (server_ts - m.created_at).abs() <= self.match_window_ms
            }) {
                return self.promote_at(index, wire.id, server_ts);
            }
        }

        self.confirmed_ids.insert(wire.id);
        self.insert_sorted(wire.into_message());
        LiveOutcome::Inserted
    }

    /// 追加一条乐观条目（本地立即上屏）
    pub fn push_optimistic(&mut self, local_id: Uuid, body: &str) -> ChatMessage {
        let message = ChatMessage {
            server_id: None,
            local_id: Some(local_id),
            conversation_id: self.conversation_id,
            sender_id: self.self_id,
            body: body.to_string(),
            created_at: TimeNormalizer::now_utc_millis(),
            status: DeliveryStatus::Pending,
        };
        self.insert_sorted(message.clone());
        message
    }

    /// 用请求/响应通道的返回值直接确认乐观条目
    ///
    /// 与实时回显竞态时按 server_id 去重收敛：消息已在，则仅移除残留的乐观条目
    pub fn confirm_optimistic(&mut self, local_id: Uuid, wire: WireMessage) -> LiveOutcome {
        if self.confirmed_ids.contains(&wire.id) {
            if let Some(index) = self.find_pending_by_local_id(local_id) {
                self.messages.remove(index);
            }
            return LiveOutcome::Duplicate;
        }
        let server_ts = TimeNormalizer::normalize_or_now(&wire.created_at);
        match self.find_pending_by_local_id(local_id) {
            Some(index) => self.promote_at(index, wire.id, server_ts),
            // 条目已不在（例如中途整批重载）：按普通消息并入
            None => self.apply_live(wire),
        }
    }

    /// 将乐观条目标记为失败（条目保留在原位，供 UI 展示与重试）
    pub fn mark_failed(&mut self, local_id: Uuid) -> bool {
        match self.find_pending_by_local_id(local_id) {
            Some(index) => {
                self.messages[index].status = DeliveryStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// 失败条目重新排队（重试发送前调用）
    ///
    /// 时间戳更新为当下并重新排序，语义上等同「重新发出这条消息」
    pub fn requeue_optimistic(&mut self, local_id: Uuid) -> Option<ChatMessage> {
        let index = self
            .messages
            .iter()
            .position(|m| m.local_id == Some(local_id) && m.status == DeliveryStatus::Failed)?;
        let mut message = self.messages.remove(index);
        debug_assert!(message.status.can_transition_to(DeliveryStatus::Pending));
        message.status = DeliveryStatus::Pending;
        message.created_at = TimeNormalizer::now_utc_millis();
        self.insert_sorted(message.clone());
        Some(message)
    }

    /// 当前会话记录（始终有序、id 无重复）
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 未确认（Pending）条目数
    pub fn pending_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.status == DeliveryStatus::Pending)
            .count()
    }

    /// 已落库（带服务端 ID）条目数，分页加载时作为 offset 用
    pub fn confirmed_count(&self) -> usize {
        self.messages.iter().filter(|m| m.server_id.is_some()).count()
    }

    pub fn conversation_id(&self) -> u64 {
        self.conversation_id
    }

    fn find_pending_by_local_id(&self, local_id: Uuid) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.local_id == Some(local_id) && m.status == DeliveryStatus::Pending)
    }

    /// 就地确认：赋 server_id、改状态、采用服务端时间戳并重新排序
    fn promote_at(&mut self, index: usize, server_id: u64, server_ts: i64) -> LiveOutcome {
        let mut message = self.messages.remove(index);
        let local_id = message.local_id.unwrap_or_default();
        message.server_id = Some(server_id);
        message.status = DeliveryStatus::Confirmed;
        message.created_at = server_ts;
        self.confirmed_ids.insert(server_id);
        self.insert_sorted(message);
        debug!("✨ 乐观条目已确认: local_id={} server_id={}", local_id, server_id);
        LiveOutcome::ConfirmedOptimistic(local_id)
    }

    fn insert_sorted(&mut self, message: ChatMessage) {
        let key = message.sort_key();
        let pos = self.messages.partition_point(|m| m.sort_key() <= key);
        self.messages.insert(pos, message);
    }
}
