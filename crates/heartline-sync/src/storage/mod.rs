//! 本地持久化层
//!
//! 未读账本、通知记录等需要跨重启存活的状态都经由 [`DurableStore`] 读写。
//! 默认实现为基于 sled 的 [`SledStore`]，测试中可替换为内存实现。

pub mod kv;

pub use kv::{get_json, put_json, DurableStore, SledStore};

#[cfg(test)]
pub use kv::test_helpers::MemoryStore;
