use crate::events::{OrderPlaced, UserEvent};
use async_trait::async_trait;
use courier::delivery::{DeliveryHandler, Outcome};
use courier::envelope::EventEnvelope;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 审计服务：记录每一次登录
#[derive(Default)]
pub struct AuditHandler {
    recorded: AtomicUsize,
}

impl AuditHandler {
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeliveryHandler for AuditHandler {
    fn handler_name(&self) -> &str {
        "audit"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Outcome {
        let event: UserEvent = match envelope.payload_as() {
            Ok(event) => event,
            Err(e) => return Outcome::nack(e.to_string()),
        };
        self.recorded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target = "audit",
            user_id = %event.user_id,
            event = %event.event_type,
            sequence_id = envelope.sequence_id(),
            "audit record written"
        );
        Outcome::Ack
    }
}

/// 通知服务：为登录发送提醒
#[derive(Default)]
pub struct NotificationHandler {
    sent: AtomicUsize,
}

impl NotificationHandler {
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeliveryHandler for NotificationHandler {
    fn handler_name(&self) -> &str {
        "notification"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Outcome {
        let event: UserEvent = match envelope.payload_as() {
            Ok(event) => event,
            Err(e) => return Outcome::nack(e.to_string()),
        };
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target = "notification",
            user_id = %event.user_id,
            "login notification sent"
        );
        Outcome::Ack
    }
}

/// 订单履约：模拟处理下单事件
#[derive(Default)]
pub struct OrderHandler {
    fulfilled: AtomicUsize,
}

impl OrderHandler {
    pub fn fulfilled(&self) -> usize {
        self.fulfilled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeliveryHandler for OrderHandler {
    fn handler_name(&self) -> &str {
        "order"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Outcome {
        let order: OrderPlaced = match envelope.payload_as() {
            Ok(order) => order,
            Err(e) => return Outcome::nack(e.to_string()),
        };
        tracing::info!(target = "order", order_id = %order.order_id, details = %order.details, "fulfilling order");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.fulfilled.fetch_add(1, Ordering::Relaxed);
        Outcome::Ack
    }
}
