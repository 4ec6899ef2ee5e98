//! 消费组（ConsumerGroup）与分区游标
//!
//! 每个分区键一个独立的游标槽（`CursorSlot`），分区之间互不加锁。槽内两个水位：
//! - 游标：该组在该分区最后一次确认的 `sequence_id`（尚无确认时为 0），只前移；
//! - 终态水位：已到终态（确认或死信）的最高 `sequence_id`，不低于游标。
//!
//! 死信不移动游标，但会抬高终态水位，重启或从快照恢复后不再重投已死信的信封。
//!
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 单个分区的游标
#[derive(Debug, Default)]
pub struct CursorSlot {
    acked: AtomicU64,
    terminal: AtomicU64,
}

impl CursorSlot {
    /// 最后确认的序号
    pub fn get(&self) -> u64 {
        self.acked.load(Ordering::Acquire)
    }

    /// 已到终态的最高序号
    pub fn terminal(&self) -> u64 {
        self.terminal.load(Ordering::Acquire).max(self.get())
    }

    /// 确认 `sequence_id`：前移游标与终态水位，若游标未前移返回 false
    pub(crate) fn advance(&self, sequence_id: u64) -> bool {
        self.terminal.fetch_max(sequence_id, Ordering::AcqRel);
        self.acked.fetch_max(sequence_id, Ordering::AcqRel) < sequence_id
    }

    /// 死信 `sequence_id`：只抬高终态水位
    pub(crate) fn mark_terminal(&self, sequence_id: u64) {
        self.terminal.fetch_max(sequence_id, Ordering::AcqRel);
    }
}

/// 消费组快照，用于注销后恢复
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    /// 分区键 -> 最后确认的序号
    pub cursors: BTreeMap<String, u64>,
    /// 分区键 -> 终态水位，只记录高于游标的分区（死信之后尚无新的确认）
    #[serde(default)]
    pub terminal: BTreeMap<String, u64>,
}

impl From<BTreeMap<String, u64>> for GroupSnapshot {
    fn from(cursors: BTreeMap<String, u64>) -> Self {
        Self {
            cursors,
            terminal: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct ConsumerGroup {
    name: String,
    cursors: DashMap<String, Arc<CursorSlot>>,
}

impl ConsumerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cursors: DashMap::new(),
        }
    }

    /// 从已有快照恢复
    pub fn with_snapshot(name: impl Into<String>, snapshot: GroupSnapshot) -> Self {
        let group = Self::new(name);
        for (key, seq) in snapshot.cursors {
            group.slot(&key).advance(seq);
        }
        for (key, seq) in snapshot.terminal {
            group.slot(&key).mark_terminal(seq);
        }
        group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 分区当前游标，未知分区为 0
    pub fn cursor(&self, partition_key: &str) -> u64 {
        self.cursors
            .get(partition_key)
            .map(|slot| slot.get())
            .unwrap_or(0)
    }

    /// 所有分区的游标
    pub fn cursors(&self) -> BTreeMap<String, u64> {
        self.cursors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect()
    }

    /// 游标连同终态水位
    pub fn snapshot(&self) -> GroupSnapshot {
        let mut snapshot = GroupSnapshot::default();
        for entry in self.cursors.iter() {
            let (acked, terminal) = (entry.value().get(), entry.value().terminal());
            snapshot.cursors.insert(entry.key().clone(), acked);
            if terminal > acked {
                snapshot.terminal.insert(entry.key().clone(), terminal);
            }
        }
        snapshot
    }

    pub(crate) fn slot(&self, partition_key: &str) -> Arc<CursorSlot> {
        if let Some(slot) = self.cursors.get(partition_key) {
            return slot.clone();
        }
        self.cursors
            .entry(partition_key.to_string())
            .or_default()
            .clone()
    }
}
