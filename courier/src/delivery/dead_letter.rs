//! 死信接收器（DeadLetterSink）
//!
//! 超出重试上限的信封连同失败原因一起存入死信，属于终态，需要人工介入。
//!
use crate::envelope::EventEnvelope;
use crate::error::{CourierResult as Result, FailureReason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// 死信接收器
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn deposit(&self, group: &str, envelope: &EventEnvelope, reason: &FailureReason)
    -> Result<()>;
}

/// 一条死信记录
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub group: String,
    pub envelope: EventEnvelope,
    pub reason: FailureReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// 内存版死信接收器
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    inner: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn deposit(
        &self,
        group: &str,
        envelope: &EventEnvelope,
        reason: &FailureReason,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DeadLetter {
                group: group.to_string(),
                envelope: envelope.clone(),
                reason: reason.clone(),
                dead_lettered_at: Utc::now(),
            });
        Ok(())
    }
}
