//! 投递尝试（DeliveryAttempt）状态机
//!
//! `Pending → InFlight → { Acked | Failed → Pending（退避后） | Failed → DeadLettered }`
//!
//! 每个尝试最终必然到达 `Acked` 或 `DeadLettered` 之一，不会被静默丢弃。
//!
use crate::config::BackoffPolicy;
use crate::envelope::EventEnvelope;
use crate::error::{CourierError, CourierResult as Result, FailureReason};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    InFlight,
    Acked,
    Failed,
    DeadLettered,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::InFlight => "in-flight",
            AttemptState::Acked => "acked",
            AttemptState::Failed => "failed",
            AttemptState::DeadLettered => "dead-lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Acked | AttemptState::DeadLettered)
    }
}

/// 失败之后的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 退避后重投
    RetryAfter(Duration),
    /// 转入死信
    DeadLetter(FailureReason),
}

/// 一个信封对某个消费组的投递尝试
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    envelope: EventEnvelope,
    group: String,
    attempt_count: u32,
    next_retry_at: Option<DateTime<Utc>>,
    state: AttemptState,
    last_failure: Option<FailureReason>,
}

impl DeliveryAttempt {
    /// 分发时创建，初始为 `Pending`
    pub fn new(envelope: EventEnvelope, group: impl Into<String>) -> Self {
        Self {
            envelope,
            group: group.into(),
            attempt_count: 0,
            next_retry_at: None,
            state: AttemptState::Pending,
            last_failure: None,
        }
    }

    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn last_failure(&self) -> Option<&FailureReason> {
        self.last_failure.as_ref()
    }

    /// `Pending → InFlight`，计数加一
    pub fn begin(&mut self) -> Result<()> {
        self.transition(AttemptState::Pending, AttemptState::InFlight)?;
        self.attempt_count += 1;
        self.next_retry_at = None;
        Ok(())
    }

    /// `InFlight → Acked`
    pub fn ack(&mut self) -> Result<()> {
        self.transition(AttemptState::InFlight, AttemptState::Acked)
    }

    /// `InFlight → Failed`
    pub fn fail(&mut self, reason: FailureReason) -> Result<()> {
        self.transition(AttemptState::InFlight, AttemptState::Failed)?;
        self.last_failure = Some(reason);
        Ok(())
    }

    /// 按策略决定：`Failed → Pending`（设置下次重投时间）或 `Failed → DeadLettered`
    pub fn retry_or_dead_letter(
        &mut self,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        if self.state != AttemptState::Failed {
            return Err(self.invalid(AttemptState::Pending));
        }

        if policy.exhausted(self.attempt_count) {
            self.state = AttemptState::DeadLettered;
            let last = self
                .last_failure
                .clone()
                .unwrap_or(FailureReason::HandlerFailure("unknown".to_string()));
            return Ok(RetryDecision::DeadLetter(FailureReason::PoisonMessage {
                attempts: self.attempt_count,
                last: Box::new(last),
            }));
        }

        let delay = policy.delay_for(self.attempt_count);
        self.state = AttemptState::Pending;
        self.next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        Ok(RetryDecision::RetryAfter(delay))
    }

    fn transition(&mut self, from: AttemptState, to: AttemptState) -> Result<()> {
        if self.state != from {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(())
    }

    fn invalid(&self, to: AttemptState) -> CourierError {
        CourierError::InvalidTransition {
            from: self.state.as_str(),
            to: to.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt() -> DeliveryAttempt {
        let envelope = EventEnvelope::builder()
            .event_type("USER_LOGIN")
            .partition_key("u1")
            .sequence_id(3)
            .build();
        DeliveryAttempt::new(envelope, "audit")
    }

    fn fail_once(a: &mut DeliveryAttempt, policy: &BackoffPolicy) -> RetryDecision {
        a.begin().unwrap();
        a.fail(FailureReason::HandlerFailure("boom".into())).unwrap();
        a.retry_or_dead_letter(policy, Utc::now()).unwrap()
    }

    #[test]
    fn four_failures_then_ack() {
        let policy = BackoffPolicy::default();
        let mut a = attempt();

        let mut delays = Vec::new();
        for _ in 0..4 {
            match fail_once(&mut a, &policy) {
                RetryDecision::RetryAfter(d) => delays.push(d.as_secs()),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(a.state(), AttemptState::Pending);
            assert!(a.next_retry_at().is_some());
        }
        assert_eq!(delays, vec![1, 2, 4, 8]);

        a.begin().unwrap();
        a.ack().unwrap();
        assert_eq!(a.state(), AttemptState::Acked);
        assert_eq!(a.attempt_count(), 5);
        assert!(a.state().is_terminal());
    }

    #[test]
    fn fifth_failure_dead_letters() {
        let policy = BackoffPolicy::default();
        let mut a = attempt();
        for _ in 0..4 {
            fail_once(&mut a, &policy);
        }

        let decision = fail_once(&mut a, &policy);
        match decision {
            RetryDecision::DeadLetter(FailureReason::PoisonMessage { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert_eq!(*last, FailureReason::HandlerFailure("boom".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.state(), AttemptState::DeadLettered);

        // 终态不可再次开始
        assert!(matches!(
            a.begin(),
            Err(CourierError::InvalidTransition { from: "dead-lettered", .. })
        ));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut a = attempt();
        assert!(a.ack().is_err());
        assert!(a.fail(FailureReason::HandlerTimeout).is_err());
        assert!(
            a.retry_or_dead_letter(&BackoffPolicy::default(), Utc::now())
                .is_err()
        );
        assert_eq!(a.state(), AttemptState::Pending);
        assert_eq!(a.attempt_count(), 0);
    }
}
