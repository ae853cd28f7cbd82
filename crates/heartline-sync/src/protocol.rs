//! 实时通道线上协议
//!
//! 通道载荷为 JSON 文本帧，`type` 字段作为判别标签：
//! - 客户端 → 服务端：`ping`（心跳）、`message`（发送消息）
//! - 服务端 → 客户端：`new_message`（新消息广播，含发送者本人的回显）、`pong`、`error`
//!
//! `client_ref` 是客户端生成的关联 ID（乐观条目的 local_id），服务端在回显中原样
//! 带回，用于把回显精确匹配到对应的乐观条目；不支持该字段的服务端回显里为 null，
//! 匹配退化为「发送者 + 正文 + 时间窗口」启发式。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{ChatMessage, DeliveryStatus};
use crate::error::{HeartlineError, Result};
use crate::utils::TimeNormalizer;

/// 客户端 → 服务端帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 心跳，固定间隔发送
    Ping,
    /// 发送消息
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<Uuid>,
    },
}

/// 服务端 → 客户端帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// 新消息广播（会话双方都会收到，包括发送者本人的回显）
    NewMessage { message: WireMessage },
    /// 心跳应答，收到后无需处理
    Pong,
    /// 服务端错误通告
    Error { reason: String },
}

/// 线上消息载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: u64,
    pub conversation_id: u64,
    pub sender_id: u64,
    pub body: String,
    pub created_at: String, // 服务端时间字符串，可能不带时区标识
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
}

impl WireMessage {
    /// 转换为已确认的 [`ChatMessage`]
    ///
    /// 时间戳统一经 [`TimeNormalizer`] 归一化；乐观条目匹配所需的 `client_ref`
    /// 由调用方（缓冲区）在转换前读取
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            server_id: Some(self.id),
            local_id: None,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            body: self.body,
            created_at: TimeNormalizer::normalize_or_now(&self.created_at),
            status: DeliveryStatus::Confirmed,
        }
    }
}

/// 编码客户端帧为 JSON 文本
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String> {
    serde_json::to_string(frame).map_err(|e| HeartlineError::Serialization(e.to_string()))
}

/// 解码服务端 JSON 文本帧
///
/// 无法解析的帧归为 [`HeartlineError::Protocol`]：调用方记日志后丢弃该帧，连接保持
pub fn decode_server_frame(raw: &str) -> Result<ServerFrame> {
    serde_json::from_str(raw).map_err(|e| HeartlineError::Protocol(e.to_string()))
}
