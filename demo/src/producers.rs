use crate::config::WorkshopConfig;
use crate::events::{OrderPlaced, USER_LOGIN, UserEvent};
use courier::delivery::{PublishReceipt, Publisher};
use courier::error::PublishError;
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// 用户服务：为随机用户发送登录事件，分区键为用户 id
pub async fn run_user_service(
    publisher: &Publisher,
    workshop: &WorkshopConfig,
    shutdown: &CancellationToken,
) -> Result<usize, PublishError> {
    let mut sent = 0;
    for i in 0..workshop.login_count {
        let user_id = rand::thread_rng().gen_range(1000..=9999).to_string();
        let event = UserEvent::login(&user_id);
        let receipt = publisher
            .publish_serializable(USER_LOGIN, &user_id, &event)
            .await?;
        sent += 1;
        tracing::info!(
            target = "user_service",
            user_id = %user_id,
            sequence_id = receipt.sequence_id(),
            "login event sent"
        );

        if i + 1 < workshop.login_count {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(workshop.login_pause()) => {}
            }
        }
    }
    Ok(sent)
}

/// 下单：路由键作为分区键，同一路由键上的订单严格有序
pub async fn publish_order_placed(
    publisher: &Publisher,
    routing_key: &str,
    order_id: &str,
    details: &str,
) -> Result<PublishReceipt, PublishError> {
    let order = OrderPlaced::new(order_id, details);
    let receipt = publisher
        .publish_serializable(routing_key, routing_key, &order)
        .await?;
    tracing::info!(
        target = "order_service",
        order_id,
        topic = publisher.topic(),
        sequence_id = receipt.sequence_id(),
        "order placed"
    );
    Ok(receipt)
}
