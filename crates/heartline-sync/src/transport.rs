//! 实时通道传输层
//!
//! WebSocket 连接的薄封装。监督器只依赖这里的三个 trait：
//! - [`ChannelConnector`] 建连（每次调用产生一条全新连接）
//! - [`FrameSink`] 写端（文本帧）
//! - [`FrameStream`] 读端（文本帧，`None` 表示对端关闭）
//!
//! 默认实现基于 tokio-tungstenite；测试注入 `test_helpers` 里的内存替身。
//! WebSocket 层的 Ping/Pong 由 tungstenite 自动应答，应用层心跳是协议里的
//! `ping` 文本帧，与此无关。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{HeartlineError, Result};

/// 通道写端
#[async_trait]
pub trait FrameSink: Send {
    /// 发送一帧文本
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// 主动关闭连接（尽力而为，失败只记日志）
    async fn close(&mut self);
}

/// 通道读端
#[async_trait]
pub trait FrameStream: Send {
    /// 读取下一帧文本
    ///
    /// `Ok(None)` 表示对端正常关闭或流结束；`Err` 表示传输层故障，
    /// 两者对监督器而言都会触发重连
    async fn next_text(&mut self) -> Result<Option<String>>;
}

/// 通道连接器
#[async_trait]
pub trait ChannelConnector: Send + Sync + std::fmt::Debug {
    /// 建立一条新连接，返回拆分后的写端与读端
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 基于 tokio-tungstenite 的默认连接器
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| HeartlineError::Transport(format!("连接超时（{:?}）", self.connect_timeout)))?
            .map_err(|e| HeartlineError::Transport(format!("WebSocket 握手失败: {}", e)))?;

        let (ws_tx, ws_rx) = ws.split();
        Ok((Box::new(WsFrameSink { inner: ws_tx }), Box::new(WsFrameStream { inner: ws_rx })))
    }
}

struct WsFrameSink {
    inner: SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(tungstenite::Message::Text(text))
            .await
            .map_err(|e| HeartlineError::Transport(format!("发送帧失败: {}", e)))
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            debug!("关闭 WebSocket 写端时出错（忽略）: {}", e);
        }
    }
}

struct WsFrameStream {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(HeartlineError::Transport(e.to_string())),
                Some(Ok(msg)) => match msg {
                    tungstenite::Message::Text(text) => return Ok(Some(text)),
                    tungstenite::Message::Close(_) => return Ok(None),
                    // Ping/Pong/二进制帧与应用层协议无关
                    _ => continue,
                },
            }
        }
    }
}


#[cfg(test)]
pub use test_helpers::{FakeChannelConnector, FakeChannelHandle};

#[cfg(test)]
mod tests {
    use super::*;
    use test_helpers::FakeChannelConnector;

    #[tokio::test]
    async fn test_fake_channel_round_trip() {
        let (connector, mut handles) = FakeChannelConnector::new();
        let (mut sink, mut stream) = connector.connect("ws://test/1?token=t").await.unwrap();
        let mut handle = handles.recv().await.unwrap();

        // 服务端 → 客户端
        handle.push_text(r#"{"type":"pong"}"#);
        assert_eq!(stream.next_text().await.unwrap(), Some(r#"{"type":"pong"}"#.to_string()));

        // 客户端 → 服务端
        sink.send_text(r#"{"type":"ping"}"#.to_string()).await.unwrap();
        assert_eq!(handle.next_sent().await, Some(r#"{"type":"ping"}"#.to_string()));

        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(connector.last_url().as_deref(), Some("ws://test/1?token=t"));
    }

    #[tokio::test]
    async fn test_fake_channel_sever_ends_stream() {
        let (connector, mut handles) = FakeChannelConnector::new();
        let (_sink, mut stream) = connector.connect("ws://test/1").await.unwrap();
        let mut handle = handles.recv().await.unwrap();

        handle.push_text("frame-1");
        handle.sever();

        assert_eq!(stream.next_text().await.unwrap(), Some("frame-1".to_string()));
        assert_eq!(stream.next_text().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fake_connector_scripted_failures() {
        let (connector, mut handles) = FakeChannelConnector::new();
        connector.fail_next_connects(2);

        assert!(connector.connect("ws://test/1").await.is_err());
        assert!(connector.connect("ws://test/1").await.is_err());
        assert!(connector.connect("ws://test/1").await.is_ok());
        assert_eq!(connector.attempt_count(), 3);
        assert!(handles.recv().await.is_some());
    }
}
