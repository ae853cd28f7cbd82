//! Heartline Sync - 会话实时同步核心
//!
//! 为校园心理支持应用提供学生端与咨询师端之间的会话同步能力：
//! - 📡 实时通道生命周期：建连、心跳、线性退避重连、原子断开
//! - 💬 会话记录缓冲：按时间排序、按服务端 id 去重、乐观条目回显确认
//! - 📤 出站双路径：实时直发 + 请求/响应回退，断线不丢消息
//! - 🔔 未读账本与通知日志：本地持久化，重启后恢复而非重算
//! - ⚙️ 事件驱动：有界广播事件流驱动 UI 刷新
//! - 🧵 并发安全：异步优先设计，显式注入不做全局单例
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use heartline_sync::{StaticCredentialProvider, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置同步核心
//!     let config = SyncConfig::builder()
//!         .live_url("wss://chat.example.com/live/conversations")
//!         .api_base_url("https://chat.example.com/api")
//!         .user_id(1001)
//!         .data_dir("/path/to/data")
//!         .build();
//!
//!     // 构建引擎（令牌来自宿主的登录流程）
//!     let credentials = Arc::new(StaticCredentialProvider::new("jwt-token"));
//!     let engine = SyncEngine::builder(config)
//!         .credentials(credentials)
//!         .build()
//!         .await?;
//!
//!     // 订阅事件流驱动界面刷新
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("事件: {:?}", event);
//!         }
//!     });
//!
//!     // 打开会话并收发消息
//!     let session = engine.open_conversation(42).await?;
//!     session.send_message("你好，我想预约一次咨询").await?;
//!     session.mark_read().await;
//!
//!     // 退出
//!     session.close().await;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod api;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod entities;
pub mod error;
pub mod events;
pub mod history;
pub mod notifications;
pub mod protocol;
pub mod storage;
pub mod supervisor;
pub mod transcript;
pub mod transport;
pub mod unread;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use api::{ConversationDto, HttpMessagingClient, MessagingApi};
pub use auth::{CredentialProvider, StaticCredentialProvider};
pub use config::{ReconnectConfig, SyncConfig, SyncConfigBuilder};
pub use dispatcher::{OutboundDispatcher, SendOutcome};
pub use engine::{ConversationSession, SyncEngine, SyncEngineBuilder};
pub use entities::{ChatMessage, ConversationSummary, DeliveryStatus};
pub use error::{HeartlineError, Result};
pub use events::{ConversationEvents, EventBus, EventStats, SyncEvent};
pub use history::{HistoryLoader, HistoryPage};
pub use notifications::{NotificationLog, NotificationRecord};
pub use protocol::{ClientFrame, ServerFrame, WireMessage};
pub use storage::{DurableStore, SledStore};
pub use supervisor::{ChannelSnapshot, ChannelState, ConnectionSupervisor};
pub use transcript::{LiveOutcome, TranscriptBuffer};
pub use transport::{ChannelConnector, WebSocketConnector};
pub use unread::{UnreadDelta, UnreadLedger};
pub use utils::TimeNormalizer;
