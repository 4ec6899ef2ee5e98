use anyhow::Result as AnyResult;
use async_trait::async_trait;
use courier::config::{BackoffPolicy, CoordinatorConfig, GroupConfig, PublisherConfig};
use courier::delivery::{
    ConsumerGroupCoordinator, DeliveryHandler, GroupSnapshot, InMemoryDeadLetterSink,
    InMemoryTransport, Outcome, Publisher, RedeliveryScheduler, Transport,
};
use courier::envelope::{DomainEvent, EventEnvelope};
use courier::error::{CourierError, FailureReason};
use courier::observer::{DeliveryEvent, DeliveryObserver, TracingObserver};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "user-events";

/// 可编排的处理器：按序号设定失败次数，记录每次调用
struct ScriptedHandler {
    name: &'static str,
    /// sequence_id -> 剩余失败次数
    failures: Mutex<HashMap<u64, u32>>,
    delay: Duration,
    calls: Mutex<Vec<(String, u64, bool)>>,
}

impl ScriptedHandler {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            failures: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn fail(self, sequence_id: u64, times: u32) -> Self {
        self.failures.lock().unwrap().insert(sequence_id, times);
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 该分区被观察到的序号（含重投）
    fn observed(&self, key: &str) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| k == key)
            .map(|(_, seq, _)| *seq)
            .collect()
    }

    fn calls_for(&self, seq: u64) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s, _)| *s == seq)
            .count()
    }

    fn acks_for(&self, seq: u64) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s, ok)| *s == seq && *ok)
            .count()
    }
}

#[async_trait]
impl DeliveryHandler for ScriptedHandler {
    fn handler_name(&self) -> &str {
        self.name
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Outcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let seq = envelope.sequence_id();
        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&seq) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        self.calls
            .lock()
            .unwrap()
            .push((envelope.partition_key().to_string(), seq, !fail));
        if fail {
            Outcome::nack(format!("{} rejects {seq}", self.name))
        } else {
            Outcome::Ack
        }
    }
}

#[derive(Default)]
struct RecordingObserver {
    gaps: Mutex<Vec<(u64, u64)>>,
    duplicates: Mutex<Vec<u64>>,
}

impl DeliveryObserver for RecordingObserver {
    fn observe(&self, event: DeliveryEvent<'_>) {
        match event {
            DeliveryEvent::GapDetected {
                expected, found, ..
            } => self.gaps.lock().unwrap().push((expected, found)),
            DeliveryEvent::DuplicateSkipped { sequence_id, .. } => {
                self.duplicates.lock().unwrap().push(sequence_id)
            }
            _ => {}
        }
    }
}

struct Harness {
    transport: InMemoryTransport,
    sink: InMemoryDeadLetterSink,
    publisher: Publisher,
    coordinator: Arc<ConsumerGroupCoordinator>,
    token: CancellationToken,
    scheduler_task: JoinHandle<()>,
}

impl Harness {
    fn new() -> Self {
        Self::with_observer(TracingObserver::shared())
    }

    fn with_observer(observer: Arc<dyn DeliveryObserver>) -> Self {
        let transport = InMemoryTransport::new();
        let sink = InMemoryDeadLetterSink::new();
        let token = CancellationToken::new();
        let (scheduler, scheduler_task) =
            RedeliveryScheduler::spawn(Arc::new(sink.clone()), observer.clone(), token.clone());

        let coordinator = Arc::new(
            ConsumerGroupCoordinator::builder()
                .transport(Arc::new(transport.clone()))
                .scheduler(scheduler)
                .config(CoordinatorConfig {
                    discovery_interval_ms: 10,
                })
                .observer(observer.clone())
                .build(),
        );
        let publisher = Publisher::new(
            Arc::new(transport.clone()),
            PublisherConfig::builder().topic(TOPIC).build(),
            observer,
        );

        Self {
            transport,
            sink,
            publisher,
            coordinator,
            token,
            scheduler_task,
        }
    }

    async fn publish(&self, key: &str, n: usize) {
        for i in 0..n {
            self.publisher
                .publish(DomainEvent::new(
                    "USER_LOGIN",
                    key,
                    serde_json::json!({ "event": "USER_LOGIN", "user_id": key, "i": i }),
                ))
                .await
                .unwrap();
        }
    }

    fn group(name: &str, max_attempts: u32, base_ms: u64) -> GroupConfig {
        GroupConfig::builder()
            .name(name)
            .topic(TOPIC)
            .retry(
                BackoffPolicy::builder()
                    .max_attempts(max_attempts)
                    .backoff_base_ms(base_ms)
                    .build(),
            )
            .handler_timeout_ms(5_000)
            .build()
    }

    fn cursor(&self, group: &str, key: &str) -> u64 {
        self.coordinator.group(group).unwrap().cursor(key)
    }

    async fn wait_until(&self, limit: Duration, cond: impl Fn() -> bool) {
        let _ = tokio::time::timeout(limit, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    }

    async fn stop(self) {
        self.token.cancel();
        let _ = self.scheduler_task.await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn partitions_are_delivered_in_sequence_order() -> AnyResult<()> {
    let h = Harness::new();
    let handler = Arc::new(ScriptedHandler::new("audit"));
    h.coordinator
        .register_group("audit", TOPIC, handler.clone())?;
    let handle = h.coordinator.clone().start();

    for key in ["u1", "u2", "u3"] {
        h.publish(key, 10).await;
    }
    h.wait_until(Duration::from_secs(5), || {
        ["u1", "u2", "u3"].iter().all(|k| h.cursor("audit", k) == 10)
    })
    .await;

    for key in ["u1", "u2", "u3"] {
        assert_eq!(handler.observed(key), (1..=10).collect::<Vec<_>>());
        assert_eq!(h.cursor("audit", key), 10);
    }

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failing_group_stalls_while_other_group_advances() -> AnyResult<()> {
    let h = Harness::new();
    let audit = Arc::new(ScriptedHandler::new("audit").fail(3, u32::MAX));
    let notification = Arc::new(ScriptedHandler::new("notification"));
    h.coordinator.register_group_with(
        Harness::group("audit", 5, 1_000),
        audit.clone(),
        GroupSnapshot::default(),
    )?;
    h.coordinator.register_group_with(
        Harness::group("notification", 5, 1_000),
        notification.clone(),
        GroupSnapshot::default(),
    )?;

    h.publish("u1", 3).await;
    let started = tokio::time::Instant::now();
    let handle = h.coordinator.clone().start();

    h.wait_until(Duration::from_secs(120), || h.sink.len() == 1)
        .await;
    let elapsed = started.elapsed();

    assert_eq!(h.cursor("audit", "u1"), 2);
    assert_eq!(h.cursor("notification", "u1"), 3);
    assert_eq!(audit.calls_for(3), 5);
    assert_eq!(audit.acks_for(3), 0);
    assert!(elapsed >= Duration::from_secs(15), "{elapsed:?}");

    let letters = h.sink.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].group, "audit");
    assert_eq!(letters[0].envelope.sequence_id(), 3);
    assert!(matches!(
        letters[0].reason,
        FailureReason::PoisonMessage { attempts: 5, .. }
    ));

    // 死信之后不再重试
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(audit.calls_for(3), 5);
    assert_eq!(h.sink.len(), 1);

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn success_on_fifth_attempt_advances_cursor_once() -> AnyResult<()> {
    let h = Harness::new();
    let audit = Arc::new(ScriptedHandler::new("audit").fail(1, 4));
    h.coordinator.register_group_with(
        Harness::group("audit", 5, 1_000),
        audit.clone(),
        GroupSnapshot::default(),
    )?;

    h.publish("u1", 1).await;
    let handle = h.coordinator.clone().start();
    h.wait_until(Duration::from_secs(120), || h.cursor("audit", "u1") == 1)
        .await;

    assert_eq!(h.cursor("audit", "u1"), 1);
    assert_eq!(audit.calls_for(1), 5);
    assert_eq!(audit.acks_for(1), 1);
    assert!(h.sink.is_empty());

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dead_lettered_envelope_does_not_block_the_partition() -> AnyResult<()> {
    let h = Harness::new();
    let audit = Arc::new(ScriptedHandler::new("audit").fail(2, u32::MAX));
    h.coordinator.register_group_with(
        Harness::group("audit", 2, 10),
        audit.clone(),
        GroupSnapshot::default(),
    )?;

    h.publish("u1", 4).await;
    let handle = h.coordinator.clone().start();
    h.wait_until(Duration::from_secs(60), || h.cursor("audit", "u1") == 4)
        .await;

    assert_eq!(audit.observed("u1"), vec![1, 2, 2, 3, 4]);
    assert_eq!(h.cursor("audit", "u1"), 4);
    assert_eq!(h.sink.len(), 1);

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_group_does_not_hold_back_fast_group() -> AnyResult<()> {
    let h = Harness::new();
    let slow = Arc::new(ScriptedHandler::new("slow").slow(Duration::from_millis(200)));
    let fast = Arc::new(ScriptedHandler::new("fast"));
    h.coordinator.register_group("slow", TOPIC, slow.clone())?;
    h.coordinator.register_group("fast", TOPIC, fast.clone())?;

    h.publish("u1", 5).await;
    let handle = h.coordinator.clone().start();
    h.wait_until(Duration::from_secs(5), || h.cursor("fast", "u1") == 5)
        .await;

    assert_eq!(h.cursor("fast", "u1"), 5);
    assert!(h.cursor("slow", "u1") < 5);

    h.wait_until(Duration::from_secs(5), || h.cursor("slow", "u1") == 5)
        .await;
    assert_eq!(h.cursor("slow", "u1"), 5);
    assert_eq!(h.coordinator.cursors("fast")?, h.coordinator.cursors("slow")?);

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deregister_waits_for_in_flight_redelivery() -> AnyResult<()> {
    let h = Harness::new();
    let audit = Arc::new(ScriptedHandler::new("audit").fail(1, 2));
    h.coordinator.register_group_with(
        Harness::group("audit", 5, 1_000),
        audit.clone(),
        GroupSnapshot::default(),
    )?;

    h.publish("u1", 1).await;
    let handle = h.coordinator.clone().start();
    h.wait_until(Duration::from_secs(10), || audit.calls_for(1) >= 1)
        .await;

    let snapshot = h.coordinator.deregister_group("audit").await?;
    assert_eq!(snapshot.cursors.get("u1"), Some(&1));
    assert_eq!(audit.acks_for(1), 1);
    assert!(h.coordinator.group("audit").is_none());

    // 注销后追加的事件不再分发
    h.publish("u1", 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(audit.calls_for(2), 0);

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_group_skips_acknowledged_envelopes() -> AnyResult<()> {
    let observer = Arc::new(RecordingObserver::default());
    let h = Harness::with_observer(observer.clone());
    let audit = Arc::new(ScriptedHandler::new("audit"));
    h.coordinator.register_group_with(
        Harness::group("audit", 5, 10),
        audit.clone(),
        GroupSnapshot::from(BTreeMap::from([("u1".to_string(), 2u64)])),
    )?;

    h.publish("u1", 3).await;
    let handle = h.coordinator.clone().start();
    h.wait_until(Duration::from_secs(5), || h.cursor("audit", "u1") == 3)
        .await;

    assert_eq!(audit.observed("u1"), vec![3]);
    assert_eq!(*observer.duplicates.lock().unwrap(), vec![1, 2]);

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn gaps_and_duplicates_on_the_log_are_reported() -> AnyResult<()> {
    let observer = Arc::new(RecordingObserver::default());
    let h = Harness::with_observer(observer.clone());
    let audit = Arc::new(ScriptedHandler::new("audit"));
    h.coordinator.register_group("audit", TOPIC, audit.clone())?;

    // 直接写入传输层：序号 1、1（重复发布）、3（空洞）
    for seq in [1, 1, 3] {
        let envelope = EventEnvelope::builder()
            .event_type("USER_LOGIN")
            .partition_key("u1")
            .sequence_id(seq)
            .build();
        h.transport.append(TOPIC, "u1", &envelope).await?;
    }

    let handle = h.coordinator.clone().start();
    h.wait_until(Duration::from_secs(5), || h.cursor("audit", "u1") == 3)
        .await;

    assert_eq!(audit.observed("u1"), vec![1, 3]);
    assert_eq!(*observer.duplicates.lock().unwrap(), vec![1]);
    assert_eq!(*observer.gaps.lock().unwrap(), vec![(2, 3)]);

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dead_letter_stays_terminal_after_resume() -> AnyResult<()> {
    let h = Harness::new();
    let audit = Arc::new(ScriptedHandler::new("audit").fail(3, u32::MAX));
    h.coordinator.register_group_with(
        Harness::group("audit", 5, 1_000),
        audit.clone(),
        GroupSnapshot::default(),
    )?;

    h.publish("u1", 3).await;
    let handle = h.coordinator.clone().start();
    h.wait_until(Duration::from_secs(120), || h.sink.len() == 1)
        .await;

    let snapshot = h.coordinator.deregister_group("audit").await?;
    assert_eq!(snapshot.cursors.get("u1"), Some(&2));
    assert_eq!(snapshot.terminal.get("u1"), Some(&3));

    // 以快照重新注册：已死信的 3 不再重投，后续信封照常确认
    h.coordinator.register_group_with(
        Harness::group("audit", 5, 1_000),
        audit.clone(),
        snapshot,
    )?;
    let resumed = h.coordinator.clone().spawn_group("audit".to_string());
    h.publish("u1", 1).await;
    h.wait_until(Duration::from_secs(120), || h.cursor("audit", "u1") == 4)
        .await;

    assert_eq!(h.cursor("audit", "u1"), 4);
    assert_eq!(audit.calls_for(3), 5);
    assert_eq!(audit.acks_for(4), 1);
    assert_eq!(h.sink.len(), 1);

    handle.shutdown();
    handle.join().await;
    resumed.await?;
    h.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopped_scheduler_halts_the_group() -> AnyResult<()> {
    let h = Harness::new();
    let audit = Arc::new(ScriptedHandler::new("audit").fail(1, u32::MAX));
    h.coordinator.register_group_with(
        Harness::group("audit", 5, 1_000),
        audit.clone(),
        GroupSnapshot::default(),
    )?;
    h.publish("u1", 1).await;

    // 调度器先于协调器停止
    h.token.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let handle = h.coordinator.clone().start();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(audit.calls_for(1), 1);
    assert_eq!(h.cursor("audit", "u1"), 0);

    // 组已停止分发，注销立即返回且游标未前移
    let snapshot =
        tokio::time::timeout(Duration::from_secs(1), h.coordinator.deregister_group("audit"))
            .await??;
    assert_eq!(snapshot.cursors.get("u1").copied().unwrap_or(0), 0);
    assert!(snapshot.terminal.is_empty());

    handle.shutdown();
    handle.join().await;
    h.stop().await;
    Ok(())
}

#[tokio::test]
async fn registration_errors() -> AnyResult<()> {
    let h = Harness::new();
    let handler = Arc::new(ScriptedHandler::new("audit"));
    h.coordinator.register_group("audit", TOPIC, handler.clone())?;

    let err = h
        .coordinator
        .register_group("audit", TOPIC, handler.clone())
        .unwrap_err();
    assert!(matches!(err, CourierError::GroupAlreadyRegistered { .. }));

    let err = h.coordinator.dispatch_loop("missing").await.unwrap_err();
    assert!(matches!(err, CourierError::GroupNotFound { .. }));

    let err = h
        .coordinator
        .register_group("", TOPIC, handler)
        .unwrap_err();
    assert!(matches!(err, CourierError::Config { .. }));

    h.stop().await;
    Ok(())
}
