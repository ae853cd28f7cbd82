//! 出站消息调度
//!
//! 发送路径二选一：
//! 1. 实时通道处于 Connected 且绑定在目标会话 → 直发协议帧，确认靠服务端回显
//!    （经会话循环回到缓冲区）
//! 2. 否则回退请求/响应通道 → 响应本身就是确认，由调用方直接喂给缓冲区
//!
//! 两条路径都失败时向上抛 [`HeartlineError::SendFailure`]，由调用方把乐观条目
//! 标记为失败并提示用户。调度器不保证跨消息顺序；回显与回退确认可能竞态，
//! 一致性由缓冲区按 id 去重兜底。

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::api::MessagingApi;
use crate::error::Result;
use crate::protocol::{ClientFrame, WireMessage};
use crate::supervisor::{ChannelState, ConnectionSupervisor};

/// 一次发送的去向
#[derive(Debug)]
pub enum SendOutcome {
    /// 已经实时通道送出，等待服务端回显确认
    SentLive,
    /// 已经回退通道确认，携带服务端落库后的消息
    ConfirmedByFallback(WireMessage),
}

/// 出站消息调度器
pub struct OutboundDispatcher {
    supervisor: Arc<ConnectionSupervisor>,
    api: Arc<dyn MessagingApi>,
}

impl OutboundDispatcher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, api: Arc<dyn MessagingApi>) -> Self {
        Self { supervisor, api }
    }

    /// 发送一条消息
    ///
    /// `client_ref` 是对应乐观条目的 local_id，随帧/请求上行，服务端在回显
    /// 与响应中原样带回
    pub async fn send(
        &self,
        conversation_id: u64,
        body: &str,
        client_ref: Uuid,
    ) -> Result<SendOutcome> {
        let snapshot = self.supervisor.snapshot();
        let live_available = snapshot.state == ChannelState::Connected
            && snapshot.conversation_id == Some(conversation_id);

        if live_available {
            let frame = ClientFrame::Message {
                content: body.to_string(),
                client_ref: Some(client_ref),
            };
            if self.supervisor.send_raw(&frame).await {
                debug!("📤 消息已直发实时通道: 会话 {} ref={}", conversation_id, client_ref);
                return Ok(SendOutcome::SentLive);
            }
            // 状态检查与实际写入之间通道可能刚刚断掉
            debug!("实时通道写入未成功，改走回退通道: 会话 {}", conversation_id);
        }

        let message = self
            .api
            .create_message(conversation_id, body, Some(client_ref))
            .await?;
        info!(
            "📤 消息经回退通道送达: 会话 {} 服务端 id={}",
            conversation_id, message.id
        );
        Ok(SendOutcome::ConfirmedByFallback(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FakeMessagingApi;
    use crate::auth::FakeCredentialProvider;
    use crate::config::SyncConfig;
    use crate::error::HeartlineError;
    use crate::supervisor::ChannelEvent;
    use crate::transport::FakeChannelConnector;
    use tokio::sync::mpsc;

    const CONV: u64 = 7;
    const SELF_ID: u64 = 1;

    fn test_config() -> SyncConfig {
        SyncConfig::builder()
            .live_url("ws://test/live/conversations")
            .api_base_url("http://test/api")
            .user_id(SELF_ID)
            .build()
    }

    async fn connected_supervisor() -> (
        Arc<ConnectionSupervisor>,
        crate::transport::FakeChannelHandle,
        mpsc::Receiver<ChannelEvent>,
    ) {
        let (connector, mut handles) = FakeChannelConnector::new();
        let supervisor = ConnectionSupervisor::new(
            test_config(),
            FakeCredentialProvider::with_token("jwt-token"),
            connector,
        );
        let (tx, mut rx) = mpsc::channel(64);
        supervisor.connect(CONV, tx).unwrap();
        let handle = handles.recv().await.unwrap();
        // 等到 Connected 再继续
        loop {
            match rx.recv().await.unwrap() {
                ChannelEvent::StateChanged(ChannelState::Connected) => break,
                _ => continue,
            }
        }
        (supervisor, handle, rx)
    }

    #[tokio::test]
    async fn test_send_prefers_live_channel() {
        let (supervisor, mut handle, _rx) = connected_supervisor().await;
        let api = FakeMessagingApi::new(SELF_ID);
        let dispatcher = OutboundDispatcher::new(supervisor, api.clone());

        let client_ref = Uuid::new_v4();
        let outcome = dispatcher.send(CONV, "你好", client_ref).await.unwrap();
        assert!(matches!(outcome, SendOutcome::SentLive));

        // 帧真的写进了通道（跳过建连后立刻发出的心跳帧）
        let frame = loop {
            let raw = handle.next_sent().await.expect("通道意外关闭");
            if !raw.contains(r#""type":"ping""#) {
                break raw;
            }
        };
        assert!(frame.contains("你好"));
        assert!(frame.contains(&client_ref.to_string()));

        // 回退通道没有被动用
        assert_eq!(api.stored_count(), 0);
    }

    #[tokio::test]
    async fn test_send_falls_back_when_not_connected() {
        let (connector, _handles) = FakeChannelConnector::new();
        let supervisor = ConnectionSupervisor::new(
            test_config(),
            FakeCredentialProvider::with_token("jwt-token"),
            connector,
        );
        let api = FakeMessagingApi::new(SELF_ID);
        let dispatcher = OutboundDispatcher::new(supervisor, api.clone());

        let client_ref = Uuid::new_v4();
        let outcome = dispatcher.send(CONV, "离线也要发", client_ref).await.unwrap();
        match outcome {
            SendOutcome::ConfirmedByFallback(message) => {
                assert_eq!(message.body, "离线也要发");
                assert_eq!(message.client_ref, Some(client_ref));
            }
            other => panic!("应走回退通道: {:?}", other),
        }
        assert_eq!(api.stored_count(), 1);
    }

    #[tokio::test]
    async fn test_send_falls_back_for_foreign_conversation() {
        // 通道绑定在别的会话上：对目标会话而言等于没有实时通道
        let (supervisor, _handle, _rx) = connected_supervisor().await;
        let api = FakeMessagingApi::new(SELF_ID);
        let dispatcher = OutboundDispatcher::new(supervisor, api.clone());

        let outcome = dispatcher.send(999, "另一个会话", Uuid::new_v4()).await.unwrap();
        assert!(matches!(outcome, SendOutcome::ConfirmedByFallback(_)));
        assert_eq!(api.stored_count(), 1);
    }

    #[tokio::test]
    async fn test_send_surfaces_failure_when_both_paths_dead() {
        let (connector, _handles) = FakeChannelConnector::new();
        let supervisor = ConnectionSupervisor::new(
            test_config(),
            FakeCredentialProvider::with_token("jwt-token"),
            connector,
        );
        let api = FakeMessagingApi::new(SELF_ID);
        api.set_fail_create(true);
        let dispatcher = OutboundDispatcher::new(supervisor, api);

        let err = dispatcher.send(CONV, "发不出去", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, HeartlineError::SendFailure(_)));
    }

    #[tokio::test]
    async fn test_send_falls_back_when_live_write_fails() {
        let (supervisor, mut handle, _rx) = connected_supervisor().await;
        let api = FakeMessagingApi::new(SELF_ID);
        let dispatcher = OutboundDispatcher::new(supervisor, api.clone());

        // 通道看起来还连着，但写入已经不通（正在掉线的瞬间）
        handle.refuse_uplink();
        let outcome = dispatcher.send(CONV, "正在掉线", Uuid::new_v4()).await.unwrap();
        assert!(matches!(outcome, SendOutcome::ConfirmedByFallback(_)));
        assert_eq!(api.stored_count(), 1);
    }
}
