//! 历史消息装载
//!
//! 对请求/响应通道的分页封装：打开会话时拉最新一页，向上滚动时按
//! 已装载条数翻更早的页。纯请求/响应，失败不重试，缓冲区保持原样，
//! 由调用方决定是否向用户提示。

use std::sync::Arc;

use tracing::debug;

use crate::api::MessagingApi;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::protocol::WireMessage;

/// 一页历史消息
#[derive(Debug)]
pub struct HistoryPage {
    /// 服务端返回的消息，新→旧排列（排序交给缓冲区）
    pub messages: Vec<WireMessage>,
    /// 是否还有更早的消息可翻
    pub has_more: bool,
}

/// 历史消息装载器
#[derive(Debug)]
pub struct HistoryLoader {
    api: Arc<dyn MessagingApi>,
    page_size: u32,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn MessagingApi>, config: &SyncConfig) -> Self {
        Self {
            api,
            page_size: config.history_page_size,
        }
    }

    /// 拉取最新一页（打开会话时）
    pub async fn load_latest(&self, conversation_id: u64) -> Result<HistoryPage> {
        self.load_page(conversation_id, 0).await
    }

    /// 从 `offset`（自最新一条起算的已装载条数）向更早方向翻一页
    pub async fn load_page(&self, conversation_id: u64, offset: u32) -> Result<HistoryPage> {
        let messages = self
            .api
            .fetch_messages(conversation_id, offset, self.page_size)
            .await?;
        let has_more = messages.len() as u32 == self.page_size;
        debug!(
            "📥 历史页装载完成: 会话 {} offset={} 共 {} 条 (has_more={})",
            conversation_id,
            offset,
            messages.len(),
            has_more
        );
        Ok(HistoryPage { messages, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FakeMessagingApi;
    use crate::error::HeartlineError;

    const CONV: u64 = 7;
    const PEER_ID: u64 = 2;

    fn loader_with_page_size(api: Arc<FakeMessagingApi>, page_size: u32) -> HistoryLoader {
        let config = SyncConfig::builder()
            .live_url("ws://test/live/conversations")
            .api_base_url("http://test/api")
            .user_id(1)
            .history_page_size(page_size)
            .build();
        HistoryLoader::new(api, &config)
    }

    #[tokio::test]
    async fn test_load_latest_returns_newest_page() {
        let api = FakeMessagingApi::new(1);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(api.seed_message(CONV, PEER_ID, &format!("msg {}", i), "2024-01-17T10:00:00"));
        }

        let loader = loader_with_page_size(api, 3);
        let page = loader.load_latest(CONV).await.unwrap();

        // 新→旧：最新的三条
        let got: Vec<u64> = page.messages.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[4], ids[3], ids[2]]);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_load_page_walks_towards_older() {
        let api = FakeMessagingApi::new(1);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(api.seed_message(CONV, PEER_ID, &format!("msg {}", i), "2024-01-17T10:00:00"));
        }

        let loader = loader_with_page_size(api, 3);
        let page = loader.load_page(CONV, 3).await.unwrap();

        let got: Vec<u64> = page.messages.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[1], ids[0]]);
        // 不足一整页：没有更早的了
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_empty_conversation_loads_empty_page() {
        let api = FakeMessagingApi::new(1);
        let loader = loader_with_page_size(api, 50);

        let page = loader.load_latest(CONV).await.unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_history_load_error() {
        let api = FakeMessagingApi::new(1);
        api.seed_message(CONV, PEER_ID, "hello", "2024-01-17T10:00:00");
        api.set_fail_history(true);

        let loader = loader_with_page_size(api, 50);
        let err = loader.load_latest(CONV).await.unwrap_err();
        assert!(matches!(err, HeartlineError::HistoryLoad(_)));
    }
}
