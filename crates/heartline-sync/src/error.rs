//! 统一错误类型
//!
//! 错误分级（决定调用方如何处理）：
//! - `Transport` → 由重连策略吸收，不直接抛给上层
//! - `Auth` → 致命错误，不重试，直接上抛
//! - `Protocol` → 记日志后丢弃该帧，连接保持
//! - `SendFailure` / `HistoryLoad` → 上抛给调用方，由 UI 决定是否重试

/// SDK 统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum HeartlineError {
    /// 传输层错误（socket 断开、握手失败等），重连策略内部消化
    #[error("Transport error: {0}")]
    Transport(String),

    /// 认证错误（缺少或无效凭证），致命，不触发重连
    #[error("Authentication error: {0}")]
    Auth(String),

    /// 协议错误（无法解析的帧），丢弃该帧但保持连接
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 发送失败（实时通道与回退通道均失败）
    #[error("Send failure: {0}")]
    SendFailure(String),

    /// 历史消息加载失败，缓冲区保持原状
    #[error("History load error: {0}")]
    HistoryLoad(String),

    /// 本地 KV 存储错误
    #[error("KV store error: {0}")]
    Store(String),

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 配置错误
    #[error("Config error: {0}")]
    Config(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for HeartlineError {
    fn from(error: serde_json::Error) -> Self {
        HeartlineError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for HeartlineError {
    fn from(error: std::io::Error) -> Self {
        HeartlineError::Io(error.to_string())
    }
}

impl From<sled::Error> for HeartlineError {
    fn from(error: sled::Error) -> Self {
        HeartlineError::Store(error.to_string())
    }
}

impl HeartlineError {
    /// 是否为致命错误（不应触发任何自动重试）
    pub fn is_fatal(&self) -> bool {
        matches!(self, HeartlineError::Auth(_) | HeartlineError::Config(_))
    }

    /// 是否可被重连策略吸收
    pub fn is_recoverable_by_reconnect(&self) -> bool {
        matches!(self, HeartlineError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, HeartlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(HeartlineError::Auth("no token".into()).is_fatal());
        assert!(!HeartlineError::Transport("reset".into()).is_fatal());
        assert!(HeartlineError::Transport("reset".into()).is_recoverable_by_reconnect());
        assert!(!HeartlineError::SendFailure("rejected".into()).is_recoverable_by_reconnect());
    }

    #[test]
    fn test_error_display() {
        let err = HeartlineError::Protocol("unknown frame type".into());
        assert_eq!(err.to_string(), "Protocol error: unknown frame type");
        let err = HeartlineError::Store("disk full".into());
        assert_eq!(err.to_string(), "KV store error: disk full");
    }

    #[test]
    fn test_from_serde_json() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json");
        let err: HeartlineError = bad.unwrap_err().into();
        assert!(matches!(err, HeartlineError::Serialization(_)));
    }
}
