//! 通知记录
//!
//! 新消息产生的应用内通知条目，持久化到本地存储、跨重启存活。
//! 通知中心页面按时间倒序展示，进入页面后整体标记已览。
//! 记录数量有上限，超出后淘汰最旧的条目。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::kv::keys;
use crate::storage::{put_json, DurableStore};
use crate::utils::TimeNormalizer;

/// 预览文本最大长度（字符）
const PREVIEW_MAX_CHARS: usize = 64;

/// 通知记录上限
const MAX_RECORDS: usize = 200;

/// 一条应用内通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: u64,
    pub conversation_id: u64,
    pub sender_id: u64,
    /// 消息正文预览（截断）
    pub preview: String,
    /// UTC 毫秒时间戳
    pub created_at: i64,
    pub seen: bool,
}

/// 通知记录簿
#[derive(Debug)]
pub struct NotificationLog {
    store: Arc<dyn DurableStore>,
    next_id: AtomicU64,
}

impl NotificationLog {
    pub fn new(store: Arc<dyn DurableStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            next_id: AtomicU64::new(1),
        })
    }

    /// 从持久化记录恢复 id 计数（启动时调用一次）
    pub async fn restore(&self) -> Result<()> {
        let entries = self.store.scan_prefix(keys::NOTIFICATION_PREFIX).await?;
        let max_id = entries
            .iter()
            .filter_map(|(_, bytes)| serde_json::from_slice::<NotificationRecord>(bytes).ok())
            .map(|r| r.id)
            .max()
            .unwrap_or(0);
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        debug!("🔔 通知记录已恢复: {} 条，下一 id {}", entries.len(), max_id + 1);
        Ok(())
    }

    /// 记录一条新消息通知
    pub async fn record_message(
        &self,
        conversation_id: u64,
        sender_id: u64,
        body: &str,
    ) -> Result<NotificationRecord> {
        let record = NotificationRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            conversation_id,
            sender_id,
            preview: truncate_preview(body),
            created_at: TimeNormalizer::now_utc_millis(),
            seen: false,
        };
        put_json(self.store.as_ref(), &keys::notification(record.id), &record).await?;
        self.prune_excess().await;
        Ok(record)
    }

    /// 最近 `limit` 条通知，新→旧
    pub async fn recent(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        let mut records = self.load_all().await?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// 未浏览的通知数
    pub async fn unseen_count(&self) -> Result<usize> {
        Ok(self.load_all().await?.iter().filter(|r| !r.seen).count())
    }

    /// 打开通知中心后整体标记为已览
    pub async fn mark_all_seen(&self) -> Result<()> {
        for mut record in self.load_all().await? {
            if !record.seen {
                record.seen = true;
                put_json(self.store.as_ref(), &keys::notification(record.id), &record).await?;
            }
        }
        Ok(())
    }

    /// 清空全部通知
    pub async fn clear(&self) -> Result<()> {
        for (key, _) in self.store.scan_prefix(keys::NOTIFICATION_PREFIX).await? {
            self.store.remove(&key).await?;
        }
        Ok(())
    }

    /// 全部记录，旧→新（键零填充保证扫描顺序即 id 顺序）
    async fn load_all(&self) -> Result<Vec<NotificationRecord>> {
        let entries = self.store.scan_prefix(keys::NOTIFICATION_PREFIX).await?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match serde_json::from_slice::<NotificationRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("⚠️ 通知记录损坏: {}: {}，跳过", key, e),
            }
        }
        Ok(records)
    }

    /// 超出上限时淘汰最旧的条目（尽力而为）
    async fn prune_excess(&self) {
        let entries = match self.store.scan_prefix(keys::NOTIFICATION_PREFIX).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("⚠️ 通知清理扫描失败: {}", e);
                return;
            }
        };
        if entries.len() <= MAX_RECORDS {
            return;
        }
        let excess = entries.len() - MAX_RECORDS;
        for (key, _) in entries.into_iter().take(excess) {
            if let Err(e) = self.store.remove(&key).await {
                warn!("⚠️ 通知淘汰失败: {}: {}", key, e);
            }
        }
    }
}

fn truncate_preview(body: &str) -> String {
    if body.chars().count() <= PREVIEW_MAX_CHARS {
        body.to_string()
    } else {
        let mut preview: String = body.chars().take(PREVIEW_MAX_CHARS).collect();
        preview.push('…');
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_record_and_list_newest_first() {
        let log = NotificationLog::new(MemoryStore::new());

        log.record_message(7, 2, "第一条").await.unwrap();
        log.record_message(7, 2, "第二条").await.unwrap();
        log.record_message(8, 3, "第三条").await.unwrap();

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].preview, "第三条");
        assert_eq!(recent[2].preview, "第一条");
        assert_eq!(log.unseen_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_mark_all_seen() {
        let log = NotificationLog::new(MemoryStore::new());
        log.record_message(7, 2, "hi").await.unwrap();
        log.record_message(7, 2, "again").await.unwrap();

        log.mark_all_seen().await.unwrap();
        assert_eq!(log.unseen_count().await.unwrap(), 0);

        // 新通知重新从未览算起
        log.record_message(7, 2, "newer").await.unwrap();
        assert_eq!(log.unseen_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_preview_truncated_char_safe() {
        let log = NotificationLog::new(MemoryStore::new());
        let long_body: String = "心".repeat(100);

        let record = log.record_message(7, 2, &long_body).await.unwrap();
        assert_eq!(record.preview.chars().count(), PREVIEW_MAX_CHARS + 1);
        assert!(record.preview.ends_with('…'));
    }

    #[tokio::test]
    async fn test_id_sequence_survives_restart() {
        let store = MemoryStore::new();
        {
            let log = NotificationLog::new(store.clone());
            log.record_message(7, 2, "before restart").await.unwrap();
            log.record_message(7, 2, "still before").await.unwrap();
        }

        let log = NotificationLog::new(store);
        log.restore().await.unwrap();
        let record = log.record_message(7, 2, "after restart").await.unwrap();
        assert_eq!(record.id, 3);

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].preview, "after restart");
    }

    #[tokio::test]
    async fn test_prunes_oldest_beyond_cap() {
        let log = NotificationLog::new(MemoryStore::new());
        for i in 0..(MAX_RECORDS + 5) {
            log.record_message(7, 2, &format!("msg {}", i)).await.unwrap();
        }

        let all = log.recent(MAX_RECORDS + 10).await.unwrap();
        assert_eq!(all.len(), MAX_RECORDS);
        // 留下的是最新的一段
        assert_eq!(all[0].preview, format!("msg {}", MAX_RECORDS + 4));
        assert_eq!(all.last().unwrap().preview, "msg 5");
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let log = NotificationLog::new(MemoryStore::new());
        log.record_message(7, 2, "bye").await.unwrap();
        log.clear().await.unwrap();
        assert!(log.recent(10).await.unwrap().is_empty());
        assert_eq!(log.unseen_count().await.unwrap(), 0);
    }
}
