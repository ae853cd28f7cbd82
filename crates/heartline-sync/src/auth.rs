//! 凭证提供者
//!
//! 认证与令牌存储由宿主应用负责（登录流程、刷新、持久化），本 SDK 只在建立
//! 实时通道时同步读取一次当前令牌。读不到令牌视为致命 Auth 错误，不触发重连，
//! 由宿主引导用户重新登录。

/// 凭证提供者 trait（由宿主应用实现）
pub trait CredentialProvider: Send + Sync + std::fmt::Debug {
    /// 当前访问令牌；None 表示未登录或令牌已失效
    fn access_token(&self) -> Option<String>;
}

/// 固定令牌的凭证提供者（示例与调试用）
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    token: String,
}

impl StaticCredentialProvider {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn access_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}


#[cfg(test)]
pub use test_helpers::FakeCredentialProvider;
