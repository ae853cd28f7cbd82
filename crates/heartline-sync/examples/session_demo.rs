//! 会话同步演示
//!
//! 连接到一个运行中的 Heartline 服务端，打开会话、发送消息并打印同步事件。
//! 服务端地址与凭证通过环境变量配置：
//!
//! ```text
//! HEARTLINE_LIVE_URL=ws://127.0.0.1:9080/live/conversations \
//! HEARTLINE_API_URL=http://127.0.0.1:9080/api \
//! HEARTLINE_TOKEN=<jwt> \
//! HEARTLINE_USER_ID=1001 \
//! HEARTLINE_CONVERSATION_ID=1 \
//! cargo run --example session_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use heartline_sync::{StaticCredentialProvider, SyncConfig, SyncEngine, SyncEvent};
use tokio::time::sleep;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 会话同步演示\n");
    println!("====================================\n");

    let user_id: u64 = env_or("HEARTLINE_USER_ID", "1001").parse()?;
    let conversation_id: u64 = env_or("HEARTLINE_CONVERSATION_ID", "1").parse()?;
    let token = env_or("HEARTLINE_TOKEN", "demo-token");

    // 配置引擎
    let config = SyncConfig::builder()
        .live_url(env_or(
            "HEARTLINE_LIVE_URL",
            "ws://127.0.0.1:9080/live/conversations",
        ))
        .api_base_url(env_or("HEARTLINE_API_URL", "http://127.0.0.1:9080/api"))
        .user_id(user_id)
        .data_dir("/tmp/heartline_demo")
        .connect_timeout(5)
        .max_reconnect_attempts(3)
        .reconnect_base_delay_ms(1000)
        .build();

    // 初始化引擎（存储、网络层走默认实现）
    println!("📦 正在初始化同步引擎...");
    let engine = SyncEngine::builder(config)
        .credentials(Arc::new(StaticCredentialProvider::new(token)))
        .build()
        .await?;
    println!("✅ 引擎就绪，未读总数: {}\n", engine.aggregate_unread());

    // 订阅事件并在后台打印
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::ConnectionChanged { state, .. } => {
                    println!("   📡 通道状态: {}", state);
                }
                SyncEvent::ConnectionClosed { reason, .. } => {
                    println!("   ⏹️ 通道已终止: {}", reason);
                }
                SyncEvent::HistoryLoaded { count, has_more, .. } => {
                    println!("   📚 加载历史 {} 条（还有更多: {}）", count, has_more);
                }
                SyncEvent::HistoryLoadFailed { reason, .. } => {
                    println!("   ⚠️ 历史加载失败: {}", reason);
                }
                SyncEvent::MessageReceived { message, .. } => {
                    println!("   📥 新消息 [{}]: {}", message.sender_id, message.body);
                }
                SyncEvent::MessageConfirmed { server_id, .. } => {
                    println!("   ✅ 消息已确认, 服务端 ID: {}", server_id);
                }
                SyncEvent::MessageSendFailed { reason, .. } => {
                    println!("   ❌ 消息发送失败: {}", reason);
                }
                SyncEvent::UnreadChanged {
                    conversation_unread,
                    aggregate_unread,
                    ..
                } => {
                    println!(
                        "   🔔 未读变化: 会话 {} 条 / 总计 {} 条",
                        conversation_unread, aggregate_unread
                    );
                }
                SyncEvent::ProtocolError { reason, .. } => {
                    println!("   ⚠️ 协议错误: {}", reason);
                }
            }
        }
    });

    // 打开会话（连接实时通道 + 装载最近历史）
    println!("📖 正在打开会话 {}...", conversation_id);
    let session = engine.open_conversation(conversation_id).await?;

    // 给事件循环一点时间处理初始装载
    sleep(Duration::from_secs(1)).await;

    let transcript = session.transcript();
    println!("\n【会话记录】共 {} 条", transcript.len());
    for message in transcript.iter().rev().take(5).rev() {
        let marker = if message.sender_id == user_id { "我" } else { "对方" };
        println!("   [{}] {}", marker, message.body);
    }
    println!();

    // 发送一条消息
    println!("📤 发送测试消息...");
    match session.send_message("你好，这是一条来自演示程序的消息").await {
        Ok(pending) => println!("   ⏳ 乐观条目已入列: {:?}", pending.local_id),
        Err(e) => {
            println!("   ❌ 发送失败: {}", e);
            println!("   💡 请确保服务端正在运行（默认端口 9080）");
        }
    }

    // 等待回显确认 / 实时推送
    sleep(Duration::from_secs(3)).await;

    // 标记已读并收尾
    println!("\n📖 标记会话为已读...");
    session.mark_read().await;
    println!("   未读总数: {}", engine.aggregate_unread());

    session.close().await;
    engine.shutdown().await;

    println!("\n🎉 演示完成！\n");
    println!("====================================\n");

    Ok(())
}
