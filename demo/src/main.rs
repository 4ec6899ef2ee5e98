mod config;
mod consumers;
mod events;
mod producers;

use config::{AUDIT_GROUP, DemoConfig, NOTIFICATION_GROUP};
use consumers::{AuditHandler, NotificationHandler, OrderHandler};
use courier::config::PublisherConfig;
use courier::delivery::{
    ConsumerGroupCoordinator, GroupSnapshot, InMemoryDeadLetterSink, InMemoryTransport,
    Publisher, RedeliveryScheduler,
};
use courier::observer::TracingObserver;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let cfg = DemoConfig::load()?;
    info!(
        broker = %cfg.courier.broker_endpoint,
        user_topic = cfg.user_topic(),
        order_topic = %cfg.workshop.order_topic,
        "starting courier workshop demo"
    );

    let observer = TracingObserver::shared();
    let transport = InMemoryTransport::new();
    let sink = InMemoryDeadLetterSink::new();
    let token = CancellationToken::new();

    let (scheduler, scheduler_task) =
        RedeliveryScheduler::spawn(Arc::new(sink.clone()), observer.clone(), token.clone());

    let coordinator = Arc::new(
        ConsumerGroupCoordinator::builder()
            .transport(Arc::new(transport.clone()))
            .scheduler(scheduler)
            .config(cfg.courier.coordinator)
            .observer(observer.clone())
            .build(),
    );

    let audit = Arc::new(AuditHandler::default());
    let notification = Arc::new(NotificationHandler::default());
    let orders = Arc::new(OrderHandler::default());
    coordinator.register_group_with(
        cfg.group(AUDIT_GROUP),
        audit.clone(),
        GroupSnapshot::default(),
    )?;
    coordinator.register_group_with(
        cfg.group(NOTIFICATION_GROUP),
        notification.clone(),
        GroupSnapshot::default(),
    )?;
    coordinator.register_group_with(
        cfg.order_group(),
        orders.clone(),
        GroupSnapshot::default(),
    )?;

    let handle = coordinator.clone().start();

    let user_publisher = Publisher::new(
        Arc::new(transport.clone()),
        cfg.courier.publisher.clone(),
        observer.clone(),
    );
    let order_publisher = Publisher::new(
        Arc::new(transport.clone()),
        PublisherConfig::builder()
            .topic(cfg.workshop.order_topic.clone())
            .retry(cfg.courier.publisher.retry)
            .build(),
        observer,
    );

    let stop = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            stop.cancel();
        }
    });

    producers::publish_order_placed(
        &order_publisher,
        &cfg.workshop.order_routing_key,
        "order-1",
        "2 x coffee beans",
    )
    .await?;
    let sent = producers::run_user_service(&user_publisher, &cfg.workshop, &token).await?;
    info!(sent, "user service finished");

    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(cfg.workshop.drain_grace()) => {}
    }

    for name in coordinator.group_names() {
        info!(group = %name, cursors = ?coordinator.cursors(&name)?, "final cursors");
    }
    info!(
        audited = audit.recorded(),
        notified = notification.sent(),
        fulfilled = orders.fulfilled(),
        dead_letters = sink.len(),
        "demo summary"
    );
    if !sink.is_empty() {
        warn!(count = sink.len(), "dead letters left for inspection");
    }

    // 先停调度器：未到终态的尝试被放弃，游标不动，重启后重投
    token.cancel();
    handle.shutdown();
    handle.join().await;
    let _ = scheduler_task.await;
    Ok(())
}
