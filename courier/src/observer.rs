//! 可观测性接收器（DeliveryObserver）
//!
//! 各组件在构造时注入一个 `Arc<dyn DeliveryObserver>`，投递生命周期中的关键节点
//! 以 `DeliveryEvent` 的形式上报；默认实现 `TracingObserver` 将其转为结构化日志。
//!
use crate::envelope::EventEnvelope;
use crate::error::{CourierError, FailureReason, PublishError};
use std::sync::Arc;
use std::time::Duration;

/// 投递生命周期事件
#[derive(Debug)]
pub enum DeliveryEvent<'a> {
    Published {
        topic: &'a str,
        envelope: &'a EventEnvelope,
        offset: u64,
        attempts: u32,
    },
    PublishRetry {
        topic: &'a str,
        partition_key: &'a str,
        attempt: u32,
        delay: Duration,
        error: &'a CourierError,
    },
    PublishFailed {
        topic: &'a str,
        partition_key: &'a str,
        error: &'a PublishError,
    },
    Acked {
        group: &'a str,
        envelope: &'a EventEnvelope,
        attempt: u32,
    },
    Nacked {
        group: &'a str,
        envelope: &'a EventEnvelope,
        attempt: u32,
        reason: &'a FailureReason,
    },
    RetryScheduled {
        group: &'a str,
        envelope: &'a EventEnvelope,
        attempt: u32,
        delay: Duration,
    },
    DeadLettered {
        group: &'a str,
        envelope: &'a EventEnvelope,
        reason: &'a FailureReason,
    },
    DuplicateSkipped {
        group: &'a str,
        partition_key: &'a str,
        sequence_id: u64,
    },
    GapDetected {
        group: &'a str,
        partition_key: &'a str,
        expected: u64,
        found: u64,
    },
    TransportError {
        context: &'a str,
        error: &'a CourierError,
    },
    AttemptAbandoned {
        group: &'a str,
        envelope: &'a EventEnvelope,
        attempt: u32,
    },
}

/// 可观测性接收器
pub trait DeliveryObserver: Send + Sync {
    fn observe(&self, event: DeliveryEvent<'_>);
}

/// 基于 `tracing` 的默认实现
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl TracingObserver {
    pub fn shared() -> Arc<dyn DeliveryObserver> {
        Arc::new(Self)
    }
}

impl DeliveryObserver for TracingObserver {
    fn observe(&self, event: DeliveryEvent<'_>) {
        match event {
            DeliveryEvent::Published {
                topic,
                envelope,
                offset,
                attempts,
            } => tracing::debug!(
                topic,
                partition_key = envelope.partition_key(),
                sequence_id = envelope.sequence_id(),
                event_type = envelope.event_type(),
                offset,
                attempts,
                "event published"
            ),
            DeliveryEvent::PublishRetry {
                topic,
                partition_key,
                attempt,
                delay,
                error,
            } => tracing::warn!(
                topic,
                partition_key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transport append failed, retrying"
            ),
            DeliveryEvent::PublishFailed {
                topic,
                partition_key,
                error,
            } => tracing::error!(topic, partition_key, error = %error, "publish failed"),
            DeliveryEvent::Acked {
                group,
                envelope,
                attempt,
            } => tracing::debug!(
                group,
                partition_key = envelope.partition_key(),
                sequence_id = envelope.sequence_id(),
                attempt,
                "delivery acked"
            ),
            DeliveryEvent::Nacked {
                group,
                envelope,
                attempt,
                reason,
            } => tracing::warn!(
                group,
                partition_key = envelope.partition_key(),
                sequence_id = envelope.sequence_id(),
                attempt,
                reason = %reason,
                "delivery failed"
            ),
            DeliveryEvent::RetryScheduled {
                group,
                envelope,
                attempt,
                delay,
            } => tracing::info!(
                group,
                partition_key = envelope.partition_key(),
                sequence_id = envelope.sequence_id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "redelivery scheduled"
            ),
            DeliveryEvent::DeadLettered {
                group,
                envelope,
                reason,
            } => tracing::error!(
                group,
                partition_key = envelope.partition_key(),
                sequence_id = envelope.sequence_id(),
                event_id = %envelope.event_id(),
                reason = %reason,
                "delivery dead-lettered"
            ),
            DeliveryEvent::DuplicateSkipped {
                group,
                partition_key,
                sequence_id,
            } => tracing::trace!(group, partition_key, sequence_id, "duplicate skipped"),
            DeliveryEvent::GapDetected {
                group,
                partition_key,
                expected,
                found,
            } => tracing::warn!(group, partition_key, expected, found, "sequence gap detected"),
            DeliveryEvent::TransportError { context, error } => {
                tracing::warn!(context, error = %error, "transport error")
            }
            DeliveryEvent::AttemptAbandoned {
                group,
                envelope,
                attempt,
            } => tracing::warn!(
                group,
                partition_key = envelope.partition_key(),
                sequence_id = envelope.sequence_id(),
                attempt,
                "pending redelivery abandoned on shutdown, will be redelivered on restart"
            ),
        }
    }
}
