//! 重投调度器（RedeliveryScheduler）
//!
//! 独占所有未到终态的 `DeliveryAttempt`：
//! - 失败后按策略计算退避并放入定时队列（`DelayQueue`），到期后在独立任务中重投；
//! - 达到尝试上限时存入死信并以 `DeadLettered` 结束；死信写入失败则延后再试；
//! - 通过 oneshot 将终态（`Acked` / `DeadLettered`）回传给等待中的分区。
//!
//! 定时循环本身不等待任何处理器，单个失败信封不会阻塞调度器处理其他尝试。
//!
use super::attempt::{DeliveryAttempt, RetryDecision};
use super::handler::{DeliveryHandler, Outcome, invoke};
use super::DeadLetterSink;
use crate::config::BackoffPolicy;
use crate::error::{CourierError, CourierResult, FailureReason};
use crate::observer::{DeliveryEvent, DeliveryObserver};
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

/// 尝试的终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Acked { attempts: u32 },
    DeadLettered { reason: FailureReason },
}

/// 交给调度器的一次失败投递
pub struct RedeliveryRequest {
    /// 处于 `Failed` 状态的尝试
    pub attempt: DeliveryAttempt,
    pub handler: Arc<dyn DeliveryHandler>,
    pub policy: BackoffPolicy,
    pub handler_timeout: Duration,
}

enum Step {
    Redeliver,
    DeadLetter(FailureReason),
}

struct Scheduled {
    request: RedeliveryRequest,
    reply: oneshot::Sender<Resolution>,
    step: Step,
}

enum Completion {
    Delivered(Outcome),
    Deposited(CourierResult<()>),
}

/// 调度器句柄，可克隆共享
#[derive(Clone)]
pub struct RedeliveryScheduler {
    tx: mpsc::UnboundedSender<Scheduled>,
    pending: Arc<AtomicUsize>,
}

impl RedeliveryScheduler {
    /// 启动调度循环，`token` 取消后循环退出，仍在等待的尝试上报为 abandoned
    pub fn spawn(
        sink: Arc<dyn DeadLetterSink>,
        observer: Arc<dyn DeliveryObserver>,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = SchedulerLoop {
            rx,
            queue: DelayQueue::new(),
            entries: HashMap::new(),
            in_flight: JoinSet::new(),
            running: HashMap::new(),
            sink,
            observer,
            pending: pending.clone(),
            next_id: 0,
        };
        let task = tokio::spawn(worker.run(token));

        (Self { tx, pending }, task)
    }

    /// 登记一次失败投递，返回终态接收端
    pub fn schedule(
        &self,
        request: RedeliveryRequest,
    ) -> CourierResult<oneshot::Receiver<Resolution>> {
        if request.attempt.state() != super::AttemptState::Failed {
            return Err(CourierError::InvalidTransition {
                from: request.attempt.state().as_str(),
                to: super::AttemptState::Pending.as_str(),
            });
        }

        let (reply, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        let scheduled = Scheduled {
            request,
            reply,
            step: Step::Redeliver,
        };
        if self.tx.send(scheduled).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(CourierError::SchedulerStopped);
        }
        Ok(rx)
    }

    /// 未到终态的尝试数量
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

struct SchedulerLoop {
    rx: mpsc::UnboundedReceiver<Scheduled>,
    queue: DelayQueue<u64>,
    entries: HashMap<u64, Scheduled>,
    in_flight: JoinSet<(u64, Scheduled, Completion)>,
    /// 在途任务对应的尝试，关闭时逐个上报 abandoned
    running: HashMap<u64, DeliveryAttempt>,
    sink: Arc<dyn DeadLetterSink>,
    observer: Arc<dyn DeliveryObserver>,
    pending: Arc<AtomicUsize>,
    next_id: u64,
}

impl SchedulerLoop {
    async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(scheduled) = self.rx.recv() => self.on_failed(scheduled),
                Some(expired) = self.queue.next() => self.on_expired(expired.into_inner()),
                Some(joined) = self.in_flight.join_next() => match joined {
                    Ok((id, scheduled, completion)) => {
                        self.running.remove(&id);
                        self.on_completed(id, scheduled, completion)
                    }
                    Err(err) => tracing::error!(error = %err, "redelivery task aborted"),
                },
                else => break,
            }
        }
        self.abandon_all().await;
    }

    fn on_failed(&mut self, mut scheduled: Scheduled) {
        let id = self.next_id;
        self.next_id += 1;

        let request = &mut scheduled.request;
        match request
            .attempt
            .retry_or_dead_letter(&request.policy, Utc::now())
        {
            Ok(RetryDecision::RetryAfter(delay)) => {
                self.observer.observe(DeliveryEvent::RetryScheduled {
                    group: request.attempt.group(),
                    envelope: request.attempt.envelope(),
                    attempt: request.attempt.attempt_count(),
                    delay,
                });
                scheduled.step = Step::Redeliver;
                self.entries.insert(id, scheduled);
                self.queue.insert(id, delay);
            }
            Ok(RetryDecision::DeadLetter(reason)) => {
                scheduled.step = Step::DeadLetter(reason);
                self.spawn_deposit(id, scheduled);
            }
            Err(err) => {
                // schedule() 已校验状态，这里仅作兜底：直接死信
                tracing::error!(error = %err, "unexpected attempt state in scheduler");
                let reason = FailureReason::HandlerFailure(err.to_string());
                scheduled.step = Step::DeadLetter(reason);
                self.spawn_deposit(id, scheduled);
            }
        }
    }

    fn on_expired(&mut self, id: u64) {
        let Some(mut scheduled) = self.entries.remove(&id) else {
            return;
        };

        if matches!(scheduled.step, Step::DeadLetter(_)) {
            self.spawn_deposit(id, scheduled);
            return;
        }

        if let Err(err) = scheduled.request.attempt.begin() {
            tracing::error!(error = %err, "cannot start redelivery");
            // reply 随 scheduled 丢弃，等待方视为 abandoned
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.running.insert(id, scheduled.request.attempt.clone());
        self.in_flight.spawn(async move {
            let outcome = invoke(
                scheduled.request.handler.as_ref(),
                scheduled.request.attempt.envelope(),
                scheduled.request.handler_timeout,
            )
            .await;
            (id, scheduled, Completion::Delivered(outcome))
        });
    }

    fn on_completed(&mut self, id: u64, mut scheduled: Scheduled, completion: Completion) {
        match completion {
            Completion::Delivered(outcome) => match outcome.failure() {
                None => {
                    let attempt = &mut scheduled.request.attempt;
                    if let Err(err) = attempt.ack() {
                        tracing::error!(error = %err, "cannot ack redelivery");
                    }
                    self.observer.observe(DeliveryEvent::Acked {
                        group: attempt.group(),
                        envelope: attempt.envelope(),
                        attempt: attempt.attempt_count(),
                    });
                    let attempts = attempt.attempt_count();
                    self.resolve(scheduled, Resolution::Acked { attempts });
                }
                Some(reason) => {
                    let attempt = &mut scheduled.request.attempt;
                    self.observer.observe(DeliveryEvent::Nacked {
                        group: attempt.group(),
                        envelope: attempt.envelope(),
                        attempt: attempt.attempt_count(),
                        reason: &reason,
                    });
                    if let Err(err) = attempt.fail(reason) {
                        tracing::error!(error = %err, "cannot fail redelivery");
                    }
                    self.on_failed(scheduled);
                }
            },
            Completion::Deposited(Ok(())) => {
                let Step::DeadLetter(reason) = &scheduled.step else {
                    return;
                };
                let reason = reason.clone();
                self.observer.observe(DeliveryEvent::DeadLettered {
                    group: scheduled.request.attempt.group(),
                    envelope: scheduled.request.attempt.envelope(),
                    reason: &reason,
                });
                self.resolve(scheduled, Resolution::DeadLettered { reason });
            }
            Completion::Deposited(Err(error)) => {
                self.observer.observe(DeliveryEvent::TransportError {
                    context: "dead letter deposit",
                    error: &error,
                });
                let delay = scheduled.request.policy.backoff_cap();
                self.entries.insert(id, scheduled);
                self.queue.insert(id, delay);
            }
        }
    }

    fn spawn_deposit(&mut self, id: u64, scheduled: Scheduled) {
        let sink = self.sink.clone();
        self.running.insert(id, scheduled.request.attempt.clone());
        self.in_flight.spawn(async move {
            let result = match &scheduled.step {
                Step::DeadLetter(reason) => {
                    let attempt = &scheduled.request.attempt;
                    sink.deposit(attempt.group(), attempt.envelope(), reason)
                        .await
                }
                Step::Redeliver => Ok(()),
            };
            (id, scheduled, Completion::Deposited(result))
        });
    }

    fn resolve(&mut self, scheduled: Scheduled, resolution: Resolution) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        // 等待方可能已退出（分区被取消），此时结果只作记录
        let _ = scheduled.reply.send(resolution);
    }

    async fn abandon_all(&mut self) {
        // 中止在途任务；已完成但未取回结果的任务同样视为未到终态
        self.in_flight.shutdown().await;
        for (_, attempt) in std::mem::take(&mut self.running) {
            self.abandon(&attempt);
        }

        self.rx.close();
        while let Ok(scheduled) = self.rx.try_recv() {
            self.abandon(&scheduled.request.attempt);
        }
        for (_, scheduled) in std::mem::take(&mut self.entries) {
            self.abandon(&scheduled.request.attempt);
        }
        self.queue.clear();
    }

    fn abandon(&self, attempt: &DeliveryAttempt) {
        self.observer.observe(DeliveryEvent::AttemptAbandoned {
            group: attempt.group(),
            envelope: attempt.envelope(),
            attempt: attempt.attempt_count(),
        });
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}
