//! 未读账本
//!
//! 维护每个会话的未读数与全局总数：
//! - 只统计**非本人**发出的消息，且每条消息 id 只计一次（有界已计数集合防止
//!   同一条消息经历史装载与实时推送两条路径被重复累加）
//! - `mark_conversation_read` 清零该会话并从总数中扣除
//! - 全局总数恒等于各会话未读数之和
//! - 逐会话记录持久化到 [`DurableStore`]，重启后恢复（不从全量历史重算）
//!
//! 持久化是尽力而为：写入失败记 warn 日志，内存状态照常推进。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::storage::kv::keys;
use crate::storage::{put_json, DurableStore};

/// 一次未读数变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadDelta {
    pub conversation_id: u64,
    /// 该会话变化后的未读数
    pub conversation_unread: u32,
    /// 全局变化后的未读总数
    pub aggregate_unread: u64,
}

/// 逐会话持久化记录
#[derive(Debug, Serialize, Deserialize)]
struct UnreadRecord {
    count: u32,
    /// 已计数的消息 id，按计入顺序（重启后重建淘汰环）
    processed: Vec<u64>,
}

/// 有界已计数集合，超出容量时淘汰最旧的 id
#[derive(Debug)]
struct ProcessedRing {
    set: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl ProcessedRing {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn from_ids(ids: Vec<u64>, capacity: usize) -> Self {
        let mut ring = Self::new(capacity);
        for id in ids {
            ring.insert(id);
        }
        ring
    }

    /// 记入一个 id，已存在时返回 false
    fn insert(&mut self, id: u64) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    fn to_ids(&self) -> Vec<u64> {
        self.order.iter().copied().collect()
    }
}

#[derive(Debug)]
struct ConversationUnread {
    count: u32,
    processed: ProcessedRing,
}

#[derive(Debug, Default)]
struct LedgerInner {
    conversations: HashMap<u64, ConversationUnread>,
    total: u64,
}

/// 未读账本
#[derive(Debug)]
pub struct UnreadLedger {
    store: Arc<dyn DurableStore>,
    ring_capacity: usize,
    inner: Mutex<LedgerInner>,
    /// 串行化持久化写入，保证落盘顺序与内存变更顺序一致
    persist_gate: tokio::sync::Mutex<()>,
}

impl UnreadLedger {
    pub fn new(store: Arc<dyn DurableStore>, config: &SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            ring_capacity: config.processed_id_capacity,
            inner: Mutex::new(LedgerInner::default()),
            persist_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// 从持久化记录恢复（启动时调用一次）
    ///
    /// 坏记录跳过并记日志，不阻断其余会话的恢复
    pub async fn restore(&self) -> Result<()> {
        let entries = self.store.scan_prefix(keys::UNREAD_PREFIX).await?;
        let mut inner = self.inner.lock();
        inner.conversations.clear();
        inner.total = 0;

        for (key, bytes) in entries {
            let conversation_id = match key
                .strip_prefix(keys::UNREAD_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(id) => id,
                None => {
                    warn!("⚠️ 无法解析未读记录键: {:?}，跳过", key);
                    continue;
                }
            };
            let record: UnreadRecord = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(e) => {
                    warn!("⚠️ 未读记录损坏: 会话 {}: {}，跳过", conversation_id, e);
                    continue;
                }
            };
            inner.total += record.count as u64;
            inner.conversations.insert(
                conversation_id,
                ConversationUnread {
                    count: record.count,
                    processed: ProcessedRing::from_ids(record.processed, self.ring_capacity),
                },
            );
        }

        info!(
            "📖 未读账本已恢复: {} 个会话，共 {} 条未读",
            inner.conversations.len(),
            inner.total
        );
        Ok(())
    }

    /// 收到一条消息时调用
    ///
    /// 本人发出的消息、已计过数的 id 都不产生变化（返回 None）
    pub async fn on_message_received(
        &self,
        conversation_id: u64,
        message_id: u64,
        is_from_self: bool,
    ) -> Option<UnreadDelta> {
        if is_from_self {
            return None;
        }

        let _gate = self.persist_gate.lock().await;
        let (delta, record) = {
            let mut inner = self.inner.lock();
            let entry = inner
                .conversations
                .entry(conversation_id)
                .or_insert_with(|| ConversationUnread {
                    count: 0,
                    processed: ProcessedRing::new(self.ring_capacity),
                });
            if !entry.processed.insert(message_id) {
                debug!(
                    "🔄 消息已计过数: 会话 {} 消息 {}",
                    conversation_id, message_id
                );
                return None;
            }
            entry.count += 1;
            let record = UnreadRecord {
                count: entry.count,
                processed: entry.processed.to_ids(),
            };
            let count = entry.count;
            inner.total += 1;
            (
                UnreadDelta {
                    conversation_id,
                    conversation_unread: count,
                    aggregate_unread: inner.total,
                },
                record,
            )
        };

        self.persist(conversation_id, &record).await;
        Some(delta)
    }

    /// 会话被用户查看：清零该会话未读并从总数中扣除
    ///
    /// 本就为零时是无操作（返回 None）；已计数集合保留，防止旧消息重放后再次计数
    pub async fn mark_conversation_read(&self, conversation_id: u64) -> Option<UnreadDelta> {
        let _gate = self.persist_gate.lock().await;
        let (delta, record) = {
            let mut inner = self.inner.lock();
            let entry = inner.conversations.get_mut(&conversation_id)?;
            if entry.count == 0 {
                return None;
            }
            let prior = entry.count;
            entry.count = 0;
            let record = UnreadRecord {
                count: 0,
                processed: entry.processed.to_ids(),
            };
            inner.total = inner.total.saturating_sub(prior as u64);
            (
                UnreadDelta {
                    conversation_id,
                    conversation_unread: 0,
                    aggregate_unread: inner.total,
                },
                record,
            )
        };

        self.persist(conversation_id, &record).await;
        debug!("✅ 会话 {} 已标记为已读", conversation_id);
        Some(delta)
    }

    /// 某会话当前未读数
    pub fn unread_for(&self, conversation_id: u64) -> u32 {
        self.inner
            .lock()
            .conversations
            .get(&conversation_id)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// 全局未读总数
    pub fn aggregate_unread(&self) -> u64 {
        self.inner.lock().total
    }

    /// 各会话未读数快照（会话列表角标用）
    pub fn snapshot(&self) -> Vec<(u64, u32)> {
        let inner = self.inner.lock();
        let mut counts: Vec<(u64, u32)> = inner
            .conversations
            .iter()
            .filter(|(_, c)| c.count > 0)
            .map(|(id, c)| (*id, c.count))
            .collect();
        counts.sort_by_key(|(id, _)| *id);
        counts
    }

    async fn persist(&self, conversation_id: u64, record: &UnreadRecord) {
        let key = keys::unread_record(conversation_id);
        if let Err(e) = put_json(self.store.as_ref(), &key, record).await {
            warn!("⚠️ 未读记录持久化失败: 会话 {}: {}", conversation_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SledStore};

    const CONV_A: u64 = 1;
    const CONV_B: u64 = 2;

    fn test_config(ring_capacity: usize) -> SyncConfig {
        SyncConfig::builder()
            .live_url("ws://test/live/conversations")
            .api_base_url("http://test/api")
            .user_id(1)
            .processed_id_capacity(ring_capacity)
            .build()
    }

    fn assert_aggregate_is_sum(ledger: &UnreadLedger) {
        let sum: u64 = ledger.snapshot().iter().map(|(_, c)| *c as u64).sum();
        assert_eq!(ledger.aggregate_unread(), sum, "总数与分会话之和不一致");
    }

    #[tokio::test]
    async fn test_counts_only_messages_from_others() {
        let store = MemoryStore::new();
        let ledger = UnreadLedger::new(store, &test_config(256));

        // 本人的回显不计数
        assert!(ledger.on_message_received(CONV_A, 1, true).await.is_none());
        assert_eq!(ledger.aggregate_unread(), 0);

        let delta = ledger.on_message_received(CONV_A, 2, false).await.unwrap();
        assert_eq!(delta.conversation_unread, 1);
        assert_eq!(delta.aggregate_unread, 1);
        assert_aggregate_is_sum(&ledger);
    }

    #[tokio::test]
    async fn test_each_message_id_counted_once() {
        let store = MemoryStore::new();
        let ledger = UnreadLedger::new(store, &test_config(256));

        // 同一条消息经历史装载与实时推送各到达一次
        assert!(ledger.on_message_received(CONV_A, 10, false).await.is_some());
        assert!(ledger.on_message_received(CONV_A, 10, false).await.is_none());

        assert_eq!(ledger.unread_for(CONV_A), 1);
        assert_eq!(ledger.aggregate_unread(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_equals_sum_across_conversations() {
        let store = MemoryStore::new();
        let ledger = UnreadLedger::new(store, &test_config(256));

        ledger.on_message_received(CONV_A, 1, false).await;
        ledger.on_message_received(CONV_A, 2, false).await;
        ledger.on_message_received(CONV_B, 3, false).await;

        assert_eq!(ledger.unread_for(CONV_A), 2);
        assert_eq!(ledger.unread_for(CONV_B), 1);
        assert_eq!(ledger.aggregate_unread(), 3);
        assert_aggregate_is_sum(&ledger);
    }

    #[tokio::test]
    async fn test_mark_read_resets_and_subtracts() {
        let store = MemoryStore::new();
        let ledger = UnreadLedger::new(store, &test_config(256));

        ledger.on_message_received(CONV_A, 1, false).await;
        ledger.on_message_received(CONV_A, 2, false).await;
        ledger.on_message_received(CONV_B, 3, false).await;

        let delta = ledger.mark_conversation_read(CONV_A).await.unwrap();
        assert_eq!(delta.conversation_unread, 0);
        // 总数 = 先前总数 - 该会话未读数
        assert_eq!(delta.aggregate_unread, 1);
        assert_eq!(ledger.unread_for(CONV_A), 0);
        assert_aggregate_is_sum(&ledger);

        // 重复标记是无操作
        assert!(ledger.mark_conversation_read(CONV_A).await.is_none());
        assert!(ledger.mark_conversation_read(999).await.is_none());
    }

    #[tokio::test]
    async fn test_already_counted_id_stays_counted_after_mark_read() {
        let store = MemoryStore::new();
        let ledger = UnreadLedger::new(store, &test_config(256));

        ledger.on_message_received(CONV_A, 7, false).await;
        ledger.mark_conversation_read(CONV_A).await;

        // 重连后同一条消息重放：不得再次累加
        assert!(ledger.on_message_received(CONV_A, 7, false).await.is_none());
        assert_eq!(ledger.unread_for(CONV_A), 0);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store = MemoryStore::new();
        {
            let ledger = UnreadLedger::new(store.clone(), &test_config(256));
            ledger.on_message_received(CONV_A, 1, false).await;
            ledger.on_message_received(CONV_A, 2, false).await;
            ledger.on_message_received(CONV_B, 3, false).await;
            ledger.mark_conversation_read(CONV_B).await;
        }

        // 模拟重启：新账本从同一存储恢复
        let ledger = UnreadLedger::new(store, &test_config(256));
        ledger.restore().await.unwrap();

        assert_eq!(ledger.unread_for(CONV_A), 2);
        assert_eq!(ledger.unread_for(CONV_B), 0);
        assert_eq!(ledger.aggregate_unread(), 2);
        assert_aggregate_is_sum(&ledger);

        // 已计数集合同样恢复：旧消息重放不再计数
        assert!(ledger.on_message_received(CONV_A, 1, false).await.is_none());
    }

    #[tokio::test]
    async fn test_state_survives_restart_on_sled() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path(), 1).await.unwrap();
            let ledger = UnreadLedger::new(store.clone(), &test_config(256));
            ledger.on_message_received(CONV_A, 1, false).await;
            ledger.on_message_received(CONV_A, 2, false).await;
            ledger.on_message_received(CONV_B, 3, false).await;
            store.flush().await.unwrap();
        }

        // 真实落盘重启：重新打开同一目录下的 sled 库
        let store = SledStore::open(dir.path(), 1).await.unwrap();
        let ledger = UnreadLedger::new(store, &test_config(256));
        ledger.restore().await.unwrap();

        assert_eq!(ledger.unread_for(CONV_A), 2);
        assert_eq!(ledger.unread_for(CONV_B), 1);
        assert_eq!(ledger.aggregate_unread(), 3);
        assert_aggregate_is_sum(&ledger);

        // 已计数的 id 重放不再累加
        assert!(ledger.on_message_received(CONV_A, 1, false).await.is_none());
        assert_eq!(ledger.aggregate_unread(), 3);
    }

    #[tokio::test]
    async fn test_processed_set_is_bounded() {
        let store = MemoryStore::new();
        let ledger = UnreadLedger::new(store, &test_config(2));

        ledger.on_message_received(CONV_A, 1, false).await;
        ledger.on_message_received(CONV_A, 2, false).await;
        ledger.on_message_received(CONV_A, 3, false).await;
        assert_eq!(ledger.unread_for(CONV_A), 3);

        // 容量 2：id=1 已被淘汰，重放会再次计数；近期的 id=3 仍被挡住
        assert!(ledger.on_message_received(CONV_A, 3, false).await.is_none());
        assert!(ledger.on_message_received(CONV_A, 1, false).await.is_some());
        assert_eq!(ledger.unread_for(CONV_A), 4);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_state() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let ledger = UnreadLedger::new(store.clone(), &test_config(256));

        // 落盘失败只记日志，内存计数照常
        let delta = ledger.on_message_received(CONV_A, 1, false).await.unwrap();
        assert_eq!(delta.aggregate_unread, 1);
        assert_eq!(ledger.unread_for(CONV_A), 1);
        assert_eq!(store.len(), 0);
    }
}
