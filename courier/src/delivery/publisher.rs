//! 发布器（Publisher）
//!
//! 将领域事件封装为 `EventEnvelope` 并追加到传输层：
//! - 每个分区键一个单调序号计数器，首次使用时从传输层已追加的最大序号恢复；
//! - 同一分区键的发布串行化（持有分区锁直至追加确认），保证日志中的序号顺序；
//! - 传输失败按指数退避重试，重试期间复用同一序号，耗尽后返回 `TransportUnavailable`。
//!
//! 语义为“至少一次”：传输已确认但调用方未观察到成功时，调用方可能重复发布，
//! 下游依据 `sequence_id` 去重。
//!
use super::Transport;
use crate::config::PublisherConfig;
use crate::envelope::{DomainEvent, EventEnvelope};
use crate::error::{CourierResult, PublishError};
use crate::observer::{DeliveryEvent, DeliveryObserver, TracingObserver};
use bon::Builder;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// 发布回执
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub envelope: EventEnvelope,
    pub offset: u64,
    /// 本次发布消耗的追加尝试次数
    pub attempts: u32,
}

impl PublishReceipt {
    pub fn sequence_id(&self) -> u64 {
        self.envelope.sequence_id()
    }
}

#[derive(Builder)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    #[builder(default)]
    config: PublisherConfig,
    #[builder(default = TracingObserver::shared())]
    observer: Arc<dyn DeliveryObserver>,
    /// 分区键 -> 最近一次成功追加的序号（None 表示尚未从传输层恢复）
    #[builder(skip)]
    sequences: DashMap<String, Arc<Mutex<Option<u64>>>>,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: PublisherConfig,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Self {
        Self {
            transport,
            config,
            observer,
            sequences: DashMap::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// 发布一个领域事件
    pub async fn publish(&self, event: DomainEvent) -> Result<PublishReceipt, PublishError> {
        if event.partition_key().trim().is_empty() {
            return Err(PublishError::EmptyPartitionKey);
        }
        let (event_type, partition_key, payload) = event.into_parts();
        let topic = self.config.topic.as_str();

        let result = self
            .publish_in_partition(topic, event_type, partition_key.clone(), payload)
            .await;

        match &result {
            Ok(receipt) => self.observer.observe(DeliveryEvent::Published {
                topic,
                envelope: &receipt.envelope,
                offset: receipt.offset,
                attempts: receipt.attempts,
            }),
            Err(error) => self.observer.observe(DeliveryEvent::PublishFailed {
                topic,
                partition_key: &partition_key,
                error,
            }),
        }
        result
    }

    /// 以任意可序列化结构作为负载发布
    pub async fn publish_serializable<T: Serialize>(
        &self,
        event_type: impl Into<String>,
        partition_key: impl Into<String>,
        payload: &T,
    ) -> Result<PublishReceipt, PublishError> {
        let event = DomainEvent::from_serializable(event_type, partition_key, payload)?;
        self.publish(event).await
    }

    async fn publish_in_partition(
        &self,
        topic: &str,
        event_type: String,
        partition_key: String,
        payload: serde_json::Value,
    ) -> Result<PublishReceipt, PublishError> {
        let slot = self
            .sequences
            .entry(partition_key.clone())
            .or_default()
            .clone();
        let mut last = slot.lock().await;

        let current = match *last {
            Some(seq) => seq,
            None => {
                let (seed, _) = self
                    .with_retry(topic, &partition_key, || {
                        self.transport.last_sequence(topic, &partition_key)
                    })
                    .await?;
                let seed = seed.unwrap_or(0);
                *last = Some(seed);
                seed
            }
        };

        let envelope = EventEnvelope::builder()
            .event_type(event_type)
            .payload(payload)
            .partition_key(partition_key.clone())
            .produced_at(Utc::now())
            .sequence_id(current + 1)
            .build();

        let (offset, attempts) = self
            .with_retry(topic, &partition_key, || {
                self.transport.append(topic, &partition_key, &envelope)
            })
            .await?;

        *last = Some(envelope.sequence_id());
        Ok(PublishReceipt {
            envelope,
            offset,
            attempts,
        })
    }

    async fn with_retry<T, F, Fut>(
        &self,
        topic: &str,
        partition_key: &str,
        mut op: F,
    ) -> Result<(T, u32), PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CourierResult<T>>,
    {
        let policy = self.config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(source) if policy.exhausted(attempt) => {
                    return Err(PublishError::TransportUnavailable {
                        attempts: attempt,
                        source,
                    });
                }
                Err(error) => {
                    let delay = policy.delay_for(attempt);
                    self.observer.observe(DeliveryEvent::PublishRetry {
                        topic,
                        partition_key,
                        attempt,
                        delay,
                        error: &error,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
