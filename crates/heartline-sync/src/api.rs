//! 消息 REST API 客户端
//!
//! 实时通道只负责增量推送；历史消息拉取、发送回退通道和会话列表走这里的
//! 请求/响应面。trait 形式注入，宿主可替换为任意实现（测试用内存替身见
//! `test_helpers`）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::auth::CredentialProvider;
use crate::config::SyncConfig;
use crate::entities::ConversationSummary;
use crate::error::{HeartlineError, Result};
use crate::protocol::WireMessage;
use crate::utils::TimeNormalizer;

/// 会话条目 DTO（GET /conversations）
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationDto {
    pub id: u64,
    pub peer_id: u64,
    #[serde(default)]
    pub peer_name: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<String>, // 服务端时间字符串
    #[serde(default)]
    pub unread_count: u32, // 服务端计算的未读数，仅透传
}

impl ConversationDto {
    /// 转换为业务实体，时间戳经统一归一化
    pub fn into_summary(self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.id,
            peer_id: self.peer_id,
            peer_name: self.peer_name,
            last_message_preview: self.last_message,
            last_message_at: self
                .last_message_at
                .as_deref()
                .and_then(TimeNormalizer::normalize),
            server_unread: self.unread_count,
        }
    }
}

/// 发送消息请求体（POST /conversations/{id}/messages）
#[derive(Debug, Clone, Serialize)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
}

/// 消息 API trait（由宿主注入，测试时注入内存替身）
#[async_trait]
pub trait MessagingApi: Send + Sync + std::fmt::Debug {
    /// 拉取历史消息
    ///
    /// `offset` 从最新一条起算，返回至多 `limit` 条，新→旧排列；
    /// 排序与去重由调用方的缓冲区统一处理
    async fn fetch_messages(
        &self,
        conversation_id: u64,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<WireMessage>>;

    /// 通过请求/响应通道发送消息（实时通道不可用时的回退路径）
    ///
    /// 成功返回服务端落库后的完整消息（含分配的 id，回显 client_ref）
    async fn create_message(
        &self,
        conversation_id: u64,
        content: &str,
        client_ref: Option<Uuid>,
    ) -> Result<WireMessage>;

    /// 拉取会话列表
    async fn list_conversations(&self) -> Result<Vec<ConversationDto>>;
}

/// 基于 reqwest 的默认实现
#[derive(Debug)]
pub struct HttpMessagingClient {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpMessagingClient {
    /// 创建客户端
    pub fn new(config: &SyncConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HeartlineError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ 消息 API 客户端已创建 (base_url: {})", config.api_base_url);

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn bearer_token(&self) -> Result<String> {
        self.credentials
            .access_token()
            .ok_or_else(|| HeartlineError::Auth("缺少访问令牌".to_string()))
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingClient {
    async fn fetch_messages(
        &self,
        conversation_id: u64,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<WireMessage>> {
        let url = format!(
            "{}/conversations/{}/messages?offset={}&limit={}",
            self.base_url, conversation_id, offset, limit
        );
        debug!("📥 拉取历史消息: {}", url);

        let token = self.bearer_token()?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| HeartlineError::HistoryLoad(format!("历史消息请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ 历史消息请求失败，HTTP 状态码: {}, 错误: {}", status, error_text);
            return Err(HeartlineError::HistoryLoad(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        response
            .json::<Vec<WireMessage>>()
            .await
            .map_err(|e| HeartlineError::HistoryLoad(format!("历史消息解析失败: {}", e)))
    }

    async fn create_message(
        &self,
        conversation_id: u64,
        content: &str,
        client_ref: Option<Uuid>,
    ) -> Result<WireMessage> {
        let url = format!("{}/conversations/{}/messages", self.base_url, conversation_id);
        debug!("📤 回退通道发送消息: {}", url);

        let token = self.bearer_token()?;
        let body = CreateMessageRequest {
            content: content.to_string(),
            client_ref,
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| HeartlineError::SendFailure(format!("发送请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ 回退发送失败，HTTP 状态码: {}, 错误: {}", status, error_text);
            return Err(HeartlineError::SendFailure(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        response
            .json::<WireMessage>()
            .await
            .map_err(|e| HeartlineError::SendFailure(format!("发送响应解析失败: {}", e)))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationDto>> {
        let url = format!("{}/conversations", self.base_url);
        debug!("📥 拉取会话列表: {}", url);

        let token = self.bearer_token()?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| HeartlineError::Transport(format!("会话列表请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ 会话列表请求失败，HTTP 状态码: {}, 错误: {}", status, error_text);
            return Err(HeartlineError::Transport(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        response
            .json::<Vec<ConversationDto>>()
            .await
            .map_err(|e| HeartlineError::Serialization(format!("会话列表解析失败: {}", e)))
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use parking_lot::Mutex;

    /// 测试用：内存态消息 API
    ///
    /// `history` 按服务端存储顺序（旧→新）保存；`fetch_messages` 按新→旧分页返回，
    /// 与线上接口语义一致
    #[derive(Debug)]
    pub struct FakeMessagingApi {
        pub self_id: u64,
        history: Mutex<Vec<WireMessage>>,
        conversations: Mutex<Vec<ConversationDto>>,
        next_id: Mutex<u64>,
        fail_history: Mutex<bool>,
        fail_create: Mutex<bool>,
    }

    impl FakeMessagingApi {
        pub fn new(self_id: u64) -> Arc<Self> {
            Arc::new(Self {
                self_id,
                history: Mutex::new(Vec::new()),
                conversations: Mutex::new(Vec::new()),
                next_id: Mutex::new(1),
                fail_history: Mutex::new(false),
                fail_create: Mutex::new(false),
            })
        }

        /// 预置一条服务端历史消息，返回分配的 id
        pub fn seed_message(&self, conversation_id: u64, sender_id: u64, body: &str, created_at: &str) -> u64 {
            let id = self.allocate_id();
            self.history.lock().push(WireMessage {
                id,
                conversation_id,
                sender_id,
                body: body.to_string(),
                created_at: created_at.to_string(),
                client_ref: None,
            });
            id
        }

        pub fn seed_conversation(&self, dto: ConversationDto) {
            self.conversations.lock().push(dto);
        }

        pub fn set_fail_history(&self, fail: bool) {
            *self.fail_history.lock() = fail;
        }

        pub fn set_fail_create(&self, fail: bool) {
            *self.fail_create.lock() = fail;
        }

        /// 服务端侧存量消息总数（种子 + 回退通道创建的）
        pub fn stored_count(&self) -> usize {
            self.history.lock().len()
        }

        fn allocate_id(&self) -> u64 {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        }
    }

    #[async_trait]
    impl MessagingApi for FakeMessagingApi {
        async fn fetch_messages(
            &self,
            conversation_id: u64,
            offset: u32,
            limit: u32,
        ) -> Result<Vec<WireMessage>> {
            if *self.fail_history.lock() {
                return Err(HeartlineError::HistoryLoad("模拟故障".to_string()));
            }
            let history = self.history.lock();
            let mut newest_first: Vec<WireMessage> = history
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect();
            newest_first.reverse();
            Ok(newest_first
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        }

        async fn create_message(
            &self,
            conversation_id: u64,
            content: &str,
            client_ref: Option<Uuid>,
        ) -> Result<WireMessage> {
            if *self.fail_create.lock() {
                return Err(HeartlineError::SendFailure("模拟故障".to_string()));
            }
            let id = self.allocate_id();
            let message = WireMessage {
                id,
                conversation_id,
                sender_id: self.self_id,
                body: content.to_string(),
                created_at: TimeNormalizer::to_rfc3339(TimeNormalizer::now_utc_millis()),
                client_ref,
            };
            self.history.lock().push(message.clone());
            Ok(message)
        }

        async fn list_conversations(&self) -> Result<Vec<ConversationDto>> {
            Ok(self.conversations.lock().clone())
        }
    }
}

#[cfg(test)]
pub use test_helpers::FakeMessagingApi;
