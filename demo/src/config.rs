use courier::config::{CourierConfig, GroupConfig};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const AUDIT_GROUP: &str = "audit-service-group";
pub const NOTIFICATION_GROUP: &str = "notification-service-group";
pub const ORDER_GROUP: &str = "order-fulfilment-group";

/// 工作坊演示配置：投递核心配置 + 演示服务参数
#[derive(Clone, Debug)]
pub struct DemoConfig {
    pub courier: CourierConfig,
    pub workshop: WorkshopConfig,
}

#[derive(Clone, Debug)]
pub struct WorkshopConfig {
    /// 用户服务发送的登录事件数量
    pub login_count: usize,
    /// 两次登录之间的停顿
    pub login_pause_ms: u64,
    /// 订单事件主题
    pub order_topic: String,
    /// 订单事件的路由键
    pub order_routing_key: String,
    /// 生产结束后留给消费端的排空时间
    pub drain_grace_ms: u64,
}

impl Default for WorkshopConfig {
    fn default() -> Self {
        Self {
            login_count: 10,
            login_pause_ms: std::env::var("LOGIN_PAUSE_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(3_000),
            order_topic: std::env::var("ORDER_TOPIC")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "order-events".to_string()),
            order_routing_key: "order.placed".to_string(),
            drain_grace_ms: 2_000,
        }
    }
}

impl WorkshopConfig {
    pub fn login_pause(&self) -> Duration {
        Duration::from_millis(self.login_pause_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

impl DemoConfig {
    /// 路径取自 COURIER_CONFIG，缺省为 ./courier.toml；
    /// 投递核心读取同一文件的顶层字段，演示参数读取 `[workshop]` 表
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("COURIER_CONFIG").unwrap_or_else(|_| "courier.toml".into());
        let courier = CourierConfig::load(&path)?;

        let mut workshop = WorkshopConfig::default();
        let p = Path::new(&path);
        if p.exists() {
            match toml::from_str::<DemoToml>(&fs::read_to_string(p)?) {
                Ok(t) => {
                    if let Some(w) = t.workshop {
                        w.apply(&mut workshop);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to parse [workshop]; using defaults")
                }
            }
        }

        Ok(Self { courier, workshop })
    }

    pub fn user_topic(&self) -> &str {
        &self.courier.publisher.topic
    }

    /// 组配置：优先取文件中的同名组，否则按用户事件主题生成默认配置
    pub fn group(&self, name: &str) -> GroupConfig {
        self.courier
            .group(name)
            .cloned()
            .unwrap_or_else(|| GroupConfig::new(name, self.user_topic()))
    }

    pub fn order_group(&self) -> GroupConfig {
        self.courier
            .group(ORDER_GROUP)
            .cloned()
            .unwrap_or_else(|| GroupConfig::new(ORDER_GROUP, self.workshop.order_topic.as_str()))
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct DemoToml {
    workshop: Option<WorkshopToml>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct WorkshopToml {
    login_count: Option<usize>,
    login_pause_ms: Option<u64>,
    order_topic: Option<String>,
    order_routing_key: Option<String>,
    drain_grace_ms: Option<u64>,
}

impl WorkshopToml {
    fn apply(self, base: &mut WorkshopConfig) {
        if let Some(v) = self.login_count {
            base.login_count = v;
        }
        if let Some(v) = self.login_pause_ms {
            base.login_pause_ms = v;
        }
        if let Some(v) = self.order_topic {
            base.order_topic = v;
        }
        if let Some(v) = self.order_routing_key {
            base.order_routing_key = v;
        }
        if let Some(v) = self.drain_grace_ms {
            base.drain_grace_ms = v;
        }
    }
}
