use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const USER_LOGIN: &str = "USER_LOGIN";

/// 用户服务与各消费方共享的事件结构
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    #[serde(rename = "event")]
    pub event_type: String,
    pub user_id: String,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl UserEvent {
    pub fn login(user_id: impl Into<String>) -> Self {
        Self {
            event_type: USER_LOGIN.to_string(),
            user_id: user_id.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// 下单事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub details: String,
    pub timestamp: i64,
}

impl OrderPlaced {
    pub fn new(order_id: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            details: details.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
