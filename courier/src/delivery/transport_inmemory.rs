//! 内存版传输层（InMemoryTransport）
//!
//! 每个 (topic, partition_key) 对应一段只追加的日志，读者通过
//! `tokio::sync::watch` 感知新条目并持续尾随读取；典型用途：测试、示例与本地开发。
//!
//! 支持故障注入：`fail_next_appends(n)` 令接下来的 n 次追加失败，便于演示发布侧重试。

use crate::delivery::Transport;
use crate::envelope::EventEnvelope;
use crate::error::{CourierError, CourierResult as Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_core::stream::BoxStream;
use futures_util::stream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

struct PartitionLog {
    entries: RwLock<Vec<EventEnvelope>>,
    len: watch::Sender<usize>,
}

impl Default for PartitionLog {
    fn default() -> Self {
        let (len, _rx) = watch::channel(0);
        Self {
            entries: RwLock::new(Vec::new()),
            len,
        }
    }
}

impl PartitionLog {
    fn get(&self, offset: usize) -> Option<EventEnvelope> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(offset)
            .cloned()
    }
}

/// 内存传输层
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    logs: Arc<DashMap<(String, String), Arc<PartitionLog>>>,
    failures_pending: Arc<AtomicUsize>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 令接下来的 `n` 次追加返回传输错误
    pub fn fail_next_appends(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// 分区当前长度
    pub fn len(&self, topic: &str, partition_key: &str) -> usize {
        self.logs
            .get(&(topic.to_string(), partition_key.to_string()))
            .map(|log| *log.len.borrow())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str, partition_key: &str) -> bool {
        self.len(topic, partition_key) == 0
    }

    fn log(&self, topic: &str, partition_key: &str) -> Arc<PartitionLog> {
        self.logs
            .entry((topic.to_string(), partition_key.to_string()))
            .or_default()
            .clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn append(
        &self,
        topic: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<u64> {
        if self.take_injected_failure() {
            return Err(CourierError::transport("injected append failure"));
        }

        let log = self.log(topic, partition_key);
        let offset = {
            let mut entries = log.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.push(envelope.clone());
            entries.len() - 1
        };
        // send_replace 在没有接收者时同样更新值
        log.len.send_replace(offset + 1);
        Ok(offset as u64)
    }

    async fn read_from(
        &self,
        topic: &str,
        partition_key: &str,
        offset: u64,
    ) -> BoxStream<'static, Result<EventEnvelope>> {
        let log = self.log(topic, partition_key);
        let rx = log.len.subscribe();
        let start = offset as usize;

        let stream = stream::unfold((log, rx, start), |(log, mut rx, next)| async move {
            loop {
                if let Some(envelope) = log.get(next) {
                    return Some((Ok(envelope), (log, rx, next + 1)));
                }
                // 等待新的追加；发送端随日志常驻，不会提前关闭
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        });
        Box::pin(stream)
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .logs
            .iter()
            .filter(|entry| entry.key().0 == topic && *entry.value().len.borrow() > 0)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn last_sequence(&self, topic: &str, partition_key: &str) -> Result<Option<u64>> {
        let Some(log) = self
            .logs
            .get(&(topic.to_string(), partition_key.to_string()))
            .map(|l| Arc::clone(l.value()))
        else {
            return Ok(None);
        };
        let entries = log.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.iter().map(EventEnvelope::sequence_id).max())
    }
}
