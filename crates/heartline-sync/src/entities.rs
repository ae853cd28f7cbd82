//! 数据实体定义
//!
//! 会话同步核心使用的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 统一的数据表示
//! - 序列化/反序列化支持

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// 乐观条目，等待服务端确认
    Pending,
    /// 服务端已确认（拥有 server_id）
    Confirmed,
    /// 发送失败（实时与回退通道均失败），可由 UI 重试
    Failed,
}

impl DeliveryStatus {
    /// 检查是否可以从当前状态转换到目标状态
    pub fn can_transition_to(&self, target: DeliveryStatus) -> bool {
        match (self, target) {
            (DeliveryStatus::Pending, DeliveryStatus::Confirmed) => true,
            (DeliveryStatus::Pending, DeliveryStatus::Failed) => true,
            // 重试：失败条目重新排队
            (DeliveryStatus::Failed, DeliveryStatus::Pending) => true,
            _ => false,
        }
    }
}

/// 聊天消息实体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub server_id: Option<u64>, // 服务端消息ID（确认/同步后赋值），会话内唯一且单调
    pub local_id: Option<Uuid>, // 本地乐观条目ID，仅本端发起的消息持有
    pub conversation_id: u64,   // u64，与服务端一致
    pub sender_id: u64,         // u64，与服务端一致
    pub body: String,
    pub created_at: i64, // 毫秒时间戳（UTC，经 TimeNormalizer 归一化）
    pub status: DeliveryStatus,
}

impl ChatMessage {
    /// 排序键：(created_at, server_id)
    ///
    /// 未确认条目没有 server_id，取 u64::MAX 使其排在同时间戳的已确认消息之后
    pub fn sort_key(&self) -> (i64, u64) {
        (self.created_at, self.server_id.unwrap_or(u64::MAX))
    }

    /// 是否为服务端已确认消息
    pub fn is_confirmed(&self) -> bool {
        self.server_id.is_some() && self.status == DeliveryStatus::Confirmed
    }
}

/// 会话摘要（会话列表用）
///
/// `server_unread` 是服务端计算的未读数，仅透传给列表页展示；
/// 会话内的实时未读账本由 [`crate::unread::UnreadLedger`] 单独维护，两者不自动合并。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: u64,
    pub peer_id: u64,   // 对端用户ID（学生视角为咨询师，反之亦然）
    pub peer_name: String,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<i64>, // 毫秒时间戳（UTC）
    pub server_unread: u32,
}
