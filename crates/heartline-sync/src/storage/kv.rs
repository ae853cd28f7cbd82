//! 基于 sled 的键值持久化
//!
//! 本模块提供：
//! - 用户隔离的命名空间（每个用户一棵 `user_{id}` Tree）
//! - 值统一用 serde_json 序列化，便于排查与向后兼容
//! - 对象安全的 [`DurableStore`] 抽象，测试中可替换为内存实现

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, Tree};
use tracing::info;

use crate::error::{HeartlineError, Result};

/// 持久化后端抽象
///
/// 键为 UTF-8 字符串，值为序列化后的字节。保持对象安全，
/// serde 便捷层见 [`put_json`] / [`get_json`]。
#[async_trait]
pub trait DurableStore: Send + Sync + Debug {
    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// 按前缀扫描，返回 (键, 值) 列表
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// 落盘（退出前调用；内存实现为空操作）
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// 序列化写入（JSON）
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put_raw(key, bytes).await
}

/// 反序列化读取（JSON）
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get_raw(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// sled 实现，每个用户一棵独立的 Tree
#[derive(Debug)]
pub struct SledStore {
    db: Db,
    tree: Tree,
}

impl SledStore {
    /// 打开 `base_path/kv` 下的数据库并定位到 `user_{user_id}` 命名空间
    ///
    /// 切换账号后旧实例可能刚释放文件锁，打开失败时带退避重试几次
    pub async fn open(base_path: &Path, user_id: u64) -> Result<Arc<Self>> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| HeartlineError::Io(format!("创建存储目录失败: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err = None;
        let mut db = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db = Some(d);
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }
        let db = db.ok_or_else(|| {
            HeartlineError::Store(match last_err {
                Some(e) => format!("打开 sled 数据库失败: {}", e),
                None => "打开 sled 数据库失败".to_string(),
            })
        })?;

        let tree = db
            .open_tree(format!("user_{}", user_id))
            .map_err(|e| HeartlineError::Store(format!("打开用户 Tree 失败: {}", e)))?;

        info!("📁 本地存储就绪: {} (user_{})", kv_path.display(), user_id);
        Ok(Arc::new(Self { db, tree }))
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.tree
            .insert(key, value)
            .map_err(|e| HeartlineError::Store(format!("写入键值失败: {}", e)))?;
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .tree
            .get(key)
            .map_err(|e| HeartlineError::Store(format!("读取键值失败: {}", e)))?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|e| HeartlineError::Store(format!("删除键值失败: {}", e)))?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        for entry in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) =
                entry.map_err(|e| HeartlineError::Store(format!("前缀扫描失败: {}", e)))?;
            results.push((
                String::from_utf8_lossy(&key).into_owned(),
                value.to_vec(),
            ));
        }
        Ok(results)
    }

    /// sled 平时由后台定期刷写，这里强制一次完整落盘
    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| HeartlineError::Store(format!("刷写失败: {}", e)))?;
        Ok(())
    }
}

/// 键名约定
pub mod keys {
    /// 某会话的未读账本记录
    pub fn unread_record(conversation_id: u64) -> String {
        format!("unread_{}", conversation_id)
    }

    /// 未读账本记录的公共前缀（恢复时整体扫描）
    pub const UNREAD_PREFIX: &str = "unread_";

    /// 通知记录（键零填充，保证前缀扫描顺序与 id 顺序一致）
    pub fn notification(notification_id: u64) -> String {
        format!("notice_{:020}", notification_id)
    }

    /// 通知记录的公共前缀
    pub const NOTIFICATION_PREFIX: &str = "notice_";
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// 内存版持久化，供不落盘的测试使用
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        entries: Mutex<HashMap<String, Vec<u8>>>,
        fail_writes: Mutex<bool>,
    }

    impl MemoryStore {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// 让后续写入全部失败（模拟磁盘故障）
        pub fn set_fail_writes(&self, fail: bool) {
            *self.fail_writes.lock() = fail;
        }

        pub fn len(&self) -> usize {
            self.entries.lock().len()
        }
    }

    #[async_trait]
    impl DurableStore for MemoryStore {
        async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
            if *self.fail_writes.lock() {
                return Err(HeartlineError::Store("写入被测试拒绝".to_string()));
            }
            self.entries.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.entries.lock().get(key).cloned())
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.entries.lock().remove(key);
            Ok(())
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
            let mut results: Vec<(String, Vec<u8>)> = self
                .entries
                .lock()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            results.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(results)
        }
    }
}
