//! 投递处理器（DeliveryHandler）
//!
//! 每个业务消费方（审计、通知等）各自实现一个处理器。协调器保证“至少一次”调用，
//! 重投时同一信封可能被多次处理，因此处理器须对 `sequence_id` 幂等。
//!
use crate::envelope::EventEnvelope;
use crate::error::FailureReason;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// 单次处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack(String),
    Timeout,
}

impl Outcome {
    pub fn nack(reason: impl Into<String>) -> Self {
        Self::Nack(reason.into())
    }

    /// 失败结果对应的失败原因；`Ack` 返回 `None`
    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            Outcome::Ack => None,
            Outcome::Nack(reason) => Some(FailureReason::HandlerFailure(reason.clone())),
            Outcome::Timeout => Some(FailureReason::HandlerTimeout),
        }
    }
}

/// 投递处理器：处理一个信封并给出确认结果
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// 处理器名称（用于日志与审计）
    fn handler_name(&self) -> &str;
    /// 处理信封
    async fn handle(&self, envelope: &EventEnvelope) -> Outcome;
}

/// 调用处理器：超时记为 `Timeout`，panic 记为 `Nack`，均不会向上传播
pub(crate) async fn invoke(
    handler: &dyn DeliveryHandler,
    envelope: &EventEnvelope,
    timeout: Duration,
) -> Outcome {
    let call = AssertUnwindSafe(handler.handle(envelope)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_elapsed) => Outcome::Timeout,
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_panic)) => Outcome::Nack(format!("handler {} panicked", handler.handler_name())),
    }
}
