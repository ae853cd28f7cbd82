//! SDK 配置
//!
//! 所有可调参数集中在 [`SyncConfig`]，通过 [`SyncConfigBuilder`] 链式构建。
//! 时长类参数以秒/毫秒为单位的裸整数存储，便于序列化进应用配置文件。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HeartlineError, Result};

/// 重连配置（线性退避）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 最大重连尝试次数，耗尽后通道进入终态 Closed
    pub max_attempts: u32,
    /// 基础延迟（毫秒），第 n 次尝试前等待 base_delay_ms * n
    pub base_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2000,
        }
    }
}

impl ReconnectConfig {
    /// 第 `attempt` 次重连前的等待时长（attempt 从 1 开始计）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt as u64))
    }
}

/// 会话同步核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 实时通道基础地址，例如 `wss://chat.example.com/live/conversations`
    pub live_url: String,
    /// REST API 基础地址，例如 `https://chat.example.com/api`
    pub api_base_url: String,
    /// 当前用户 ID（区分自己/对方的消息，未读计数只统计对方的）
    pub user_id: u64,
    /// 本地持久化目录（未读账本、通知日志落在这里，按 user_id 分树）
    pub data_dir: String,
    /// 心跳间隔（秒）
    pub heartbeat_interval: u64,
    /// 单次连接尝试超时（秒）
    pub connect_timeout: u64, // 单次尝试快速失败，便于多轮重试
    /// 重连配置
    pub reconnect: ReconnectConfig,
    /// 初始历史加载条数
    pub history_page_size: u32,
    /// 乐观条目启发式匹配的时间窗口（毫秒）
    pub optimistic_match_window_ms: i64,
    /// 每会话已计数消息 ID 环容量（未读账本防重复计数）
    pub processed_id_capacity: usize,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            live_url: "ws://localhost:9080/live/conversations".to_string(),
            api_base_url: "http://localhost:9080/api".to_string(),
            user_id: 0,
            data_dir: "./heartline_data".to_string(),
            heartbeat_interval: 30,
            connect_timeout: 15,
            reconnect: ReconnectConfig::default(),
            history_page_size: 50,
            optimistic_match_window_ms: 10_000,
            processed_id_capacity: 256,
            event_buffer_size: 1000,
        }
    }
}

impl SyncConfig {
    /// 创建配置构建器
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 校验配置合法性（引擎初始化时调用）
    pub fn validate(&self) -> Result<()> {
        if self.live_url.is_empty() {
            return Err(HeartlineError::Config("live_url 不能为空".to_string()));
        }
        if self.api_base_url.is_empty() {
            return Err(HeartlineError::Config("api_base_url 不能为空".to_string()));
        }
        if self.user_id == 0 {
            return Err(HeartlineError::Config("user_id 未设置".to_string()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(HeartlineError::Config("max_attempts 必须大于 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(HeartlineError::Config("event_buffer_size 必须大于 0".to_string()));
        }
        if self.history_page_size == 0 {
            return Err(HeartlineError::Config("history_page_size 必须大于 0".to_string()));
        }
        // 容量为 0 的环留不住任何已计数 id，重放的消息会被再次累加
        if self.processed_id_capacity == 0 {
            return Err(HeartlineError::Config("processed_id_capacity 必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 拼接某会话的实时通道地址，凭证经百分号编码后作为 query 参数
    pub fn channel_url(&self, conversation_id: u64, token: &str) -> String {
        format!(
            "{}/{}?token={}",
            self.live_url.trim_end_matches('/'),
            conversation_id,
            urlencoding::encode(token)
        )
    }

    /// 心跳间隔
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// 单次连接尝试超时
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

/// 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn live_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.live_url = url.into();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn user_id(mut self, user_id: u64) -> Self {
        self.config.user_id = user_id;
        self
    }

    /// 本地持久化目录
    pub fn data_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// 心跳间隔（秒）
    pub fn heartbeat_interval(mut self, seconds: u64) -> Self {
        self.config.heartbeat_interval = seconds;
        self
    }

    /// 单次连接尝试超时（秒）
    pub fn connect_timeout(mut self, seconds: u64) -> Self {
        self.config.connect_timeout = seconds;
        self
    }

    /// 最大重连尝试次数
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// 重连基础延迟（毫秒）
    pub fn reconnect_base_delay_ms(mut self, millis: u64) -> Self {
        self.config.reconnect.base_delay_ms = millis;
        self
    }

    /// 初始历史加载条数
    pub fn history_page_size(mut self, size: u32) -> Self {
        self.config.history_page_size = size;
        self
    }

    /// 乐观条目启发式匹配的时间窗口（毫秒）
    pub fn optimistic_match_window_ms(mut self, millis: i64) -> Self {
        self.config.optimistic_match_window_ms = millis;
        self
    }

    /// 每会话已计数消息 ID 环容量
    pub fn processed_id_capacity(mut self, capacity: usize) -> Self {
        self.config.processed_id_capacity = capacity;
        self
    }

    /// 事件广播缓冲区大小
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
