//! 消费组协调器（ConsumerGroupCoordinator）
//!
//! 为每个显式注册的消费组维护分区游标并驱动分发：
//! - 周期发现主题下的分区，每个分区一个常驻任务，分区之间并发；
//! - 单个分区内严格串行：按序号读取、跳过已确认/已终结的重复信封、调用处理器；
//! - 成功即确认并前移游标；失败则登记到重投调度器，该分区异步等待尝试到达终态
//!   （确认后前移游标，死信后游标不动、抬高终态水位并继续下一个信封）；
//! - 调度器停止后组的分发随之停止，未到终态的信封留待重启后重投；
//! - 各组游标互不共享，慢组不会拖慢其他组。
//!
use super::attempt::DeliveryAttempt;
use super::group::{ConsumerGroup, GroupSnapshot};
use super::handler::{DeliveryHandler, invoke};
use super::scheduler::{RedeliveryRequest, RedeliveryScheduler, Resolution};
use super::Transport;
use crate::config::{CoordinatorConfig, GroupConfig};
use crate::envelope::EventEnvelope;
use crate::error::{CourierError, CourierResult};
use crate::observer::{DeliveryEvent, DeliveryObserver, TracingObserver};
use bon::Builder;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct GroupEntry {
    config: GroupConfig,
    group: Arc<ConsumerGroup>,
    handler: Arc<dyn DeliveryHandler>,
    token: CancellationToken,
    running: watch::Sender<bool>,
}

#[derive(Builder)]
pub struct ConsumerGroupCoordinator {
    transport: Arc<dyn Transport>,
    scheduler: RedeliveryScheduler,
    #[builder(default)]
    config: CoordinatorConfig,
    #[builder(default = TracingObserver::shared())]
    observer: Arc<dyn DeliveryObserver>,
    #[builder(skip)]
    groups: DashMap<String, Arc<GroupEntry>>,
    #[builder(skip)]
    token: CancellationToken,
}

impl ConsumerGroupCoordinator {
    /// 以默认配置注册消费组（订阅 `topic`）
    pub fn register_group(
        &self,
        name: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> CourierResult<()> {
        self.register_group_with(
            GroupConfig::new(name, topic),
            handler,
            GroupSnapshot::default(),
        )
    }

    /// 以完整配置注册消费组，可携带上次注销时的快照（或仅游标）
    pub fn register_group_with(
        &self,
        config: GroupConfig,
        handler: Arc<dyn DeliveryHandler>,
        resume_from: impl Into<GroupSnapshot>,
    ) -> CourierResult<()> {
        config.validate()?;
        let name = config.name.clone();

        match self.groups.entry(name.clone()) {
            Entry::Occupied(_) => Err(CourierError::GroupAlreadyRegistered { name }),
            Entry::Vacant(slot) => {
                let (running, _rx) = watch::channel(false);
                slot.insert(Arc::new(GroupEntry {
                    group: Arc::new(ConsumerGroup::with_snapshot(name, resume_from.into())),
                    config,
                    handler,
                    token: self.token.child_token(),
                    running,
                }));
                Ok(())
            }
        }
    }

    /// 停止组的新分发，等待在途尝试到达终态后返回最终快照
    pub async fn deregister_group(&self, name: &str) -> CourierResult<GroupSnapshot> {
        let (_, entry) = self
            .groups
            .remove(name)
            .ok_or_else(|| CourierError::GroupNotFound {
                name: name.to_string(),
            })?;

        entry.token.cancel();
        let mut running = entry.running.subscribe();
        // 发送端随 entry 存活，wait_for 不会因关闭而出错
        let _ = running.wait_for(|r| !*r).await;

        tracing::info!(group = name, "consumer group deregistered");
        Ok(entry.group.snapshot())
    }

    pub fn group(&self, name: &str) -> Option<Arc<ConsumerGroup>> {
        self.groups.get(name).map(|entry| entry.group.clone())
    }

    /// 组的游标快照
    pub fn cursors(&self, name: &str) -> CourierResult<BTreeMap<String, u64>> {
        self.group(name)
            .map(|group| group.cursors())
            .ok_or_else(|| CourierError::GroupNotFound {
                name: name.to_string(),
            })
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// 为所有已注册的组启动分发循环
    pub fn start(self: Arc<Self>) -> CoordinatorHandle {
        let tasks = self
            .group_names()
            .into_iter()
            .map(|name| self.clone().spawn_group(name))
            .collect();

        CoordinatorHandle {
            token: self.token.clone(),
            tasks,
        }
    }

    /// 在后台运行单个组的分发循环
    pub fn spawn_group(self: Arc<Self>, name: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.dispatch_loop(&name).await {
                tracing::error!(group = %name, error = %err, "dispatch loop exited with error");
            }
        })
    }

    /// 单个组的分发循环：发现分区并为每个分区运行一个串行工作者，直至组被注销或协调器关闭
    pub async fn dispatch_loop(&self, name: &str) -> CourierResult<()> {
        let entry = self
            .groups
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| CourierError::GroupNotFound {
                name: name.to_string(),
            })?;

        if entry.running.send_replace(true) {
            return Err(CourierError::GroupAlreadyRunning {
                name: name.to_string(),
            });
        }
        tracing::info!(group = name, topic = %entry.config.topic, "dispatch loop started");

        let mut workers: JoinSet<String> = JoinSet::new();
        let mut assigned: HashSet<String> = HashSet::new();
        let mut ticker = time::interval(self.config.discovery_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = entry.token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.transport.partitions(&entry.config.topic).await {
                        Ok(keys) => {
                            for key in keys {
                                if assigned.insert(key.clone()) {
                                    workers.spawn(self.worker(&entry, key).run());
                                }
                            }
                        }
                        Err(error) => self.observer.observe(DeliveryEvent::TransportError {
                            context: "partition discovery",
                            error: &error,
                        }),
                    }
                }
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    // 退出的分区在下一轮发现时重新分配
                    if let Ok(key) = finished {
                        assigned.remove(&key);
                    }
                }
            }
        }

        while workers.join_next().await.is_some() {}
        entry.running.send_replace(false);
        tracing::info!(group = name, "dispatch loop stopped");
        Ok(())
    }

    fn worker(&self, entry: &GroupEntry, partition_key: String) -> PartitionWorker {
        PartitionWorker {
            partition_key,
            config: entry.config.clone(),
            group: entry.group.clone(),
            handler: entry.handler.clone(),
            token: entry.token.clone(),
            transport: self.transport.clone(),
            scheduler: self.scheduler.clone(),
            observer: self.observer.clone(),
        }
    }
}

/// 协调器运行句柄：用于关闭与等待所有组的分发循环
pub struct CoordinatorHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Delivered {
    Acked,
    DeadLettered,
    /// 调度器已停止，尝试未到终态；游标不动，重启后重投
    Abandoned,
}

struct PartitionWorker {
    partition_key: String,
    config: GroupConfig,
    group: Arc<ConsumerGroup>,
    handler: Arc<dyn DeliveryHandler>,
    token: CancellationToken,
    transport: Arc<dyn Transport>,
    scheduler: RedeliveryScheduler,
    observer: Arc<dyn DeliveryObserver>,
}

impl PartitionWorker {
    async fn run(self) -> String {
        let topic = self.config.topic.as_str();
        let key = self.partition_key.as_str();
        let slot = self.group.slot(key);
        let mut stream = self.transport.read_from(topic, key, 0).await;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                item = stream.next() => item,
            };

            let envelope = match next {
                None => break,
                Some(Ok(envelope)) => envelope,
                Some(Err(error)) => {
                    self.observer.observe(DeliveryEvent::TransportError {
                        context: "partition read",
                        error: &error,
                    });
                    continue;
                }
            };

            let seq = envelope.sequence_id();
            let last_terminal = slot.terminal();
            if seq <= last_terminal {
                self.observer.observe(DeliveryEvent::DuplicateSkipped {
                    group: self.group.name(),
                    partition_key: key,
                    sequence_id: seq,
                });
                continue;
            }
            if seq != last_terminal + 1 {
                self.observer.observe(DeliveryEvent::GapDetected {
                    group: self.group.name(),
                    partition_key: key,
                    expected: last_terminal + 1,
                    found: seq,
                });
            }

            match self.deliver(envelope).await {
                Ok(Delivered::Acked) => {
                    slot.advance(seq);
                }
                Ok(Delivered::DeadLettered) => slot.mark_terminal(seq),
                Ok(Delivered::Abandoned) => {
                    // 调度器已停止：停止整个组，避免重新分配分区后无退避地重投
                    tracing::warn!(
                        group = self.group.name(),
                        partition_key = key,
                        sequence_id = seq,
                        "redelivery scheduler stopped, halting consumer group"
                    );
                    self.token.cancel();
                    break;
                }
                Err(err) => {
                    tracing::error!(group = self.group.name(), partition_key = key, error = %err, "delivery failed");
                    break;
                }
            }
        }

        self.partition_key
    }

    async fn deliver(&self, envelope: EventEnvelope) -> CourierResult<Delivered> {
        let mut attempt = DeliveryAttempt::new(envelope, self.group.name());
        attempt.begin()?;

        let outcome = invoke(
            self.handler.as_ref(),
            attempt.envelope(),
            self.config.handler_timeout(),
        )
        .await;

        let Some(reason) = outcome.failure() else {
            attempt.ack()?;
            self.observer.observe(DeliveryEvent::Acked {
                group: self.group.name(),
                envelope: attempt.envelope(),
                attempt: attempt.attempt_count(),
            });
            return Ok(Delivered::Acked);
        };

        self.observer.observe(DeliveryEvent::Nacked {
            group: self.group.name(),
            envelope: attempt.envelope(),
            attempt: attempt.attempt_count(),
            reason: &reason,
        });
        attempt.fail(reason)?;

        let request = RedeliveryRequest {
            attempt,
            handler: self.handler.clone(),
            policy: self.config.retry,
            handler_timeout: self.config.handler_timeout(),
        };
        let resolution = match self.scheduler.schedule(request) {
            Ok(rx) => rx.await,
            Err(_) => return Ok(Delivered::Abandoned),
        };

        // 此处不响应取消：在途尝试必须先到达终态
        Ok(match resolution {
            Ok(Resolution::Acked { .. }) => Delivered::Acked,
            Ok(Resolution::DeadLettered { .. }) => Delivered::DeadLettered,
            Err(_) => Delivered::Abandoned,
        })
    }
}
