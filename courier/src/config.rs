//! 配置面（Configuration）
//!
//! 面向运维暴露的最小配置集合：
//! - 代理连接端点与主题名称；
//! - 发布侧重试策略；
//! - 每个消费组的标识、最大重试次数、退避基数与处理超时；
//! - 协调器的分区发现间隔。
//!
//! 所有字段均带默认值，可由 TOML 文件覆盖，再由环境变量覆盖端点与主题。
//!
use crate::error::{CourierError, CourierResult};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TOPIC: &str = "user-events";

/// 指数退避策略：第 n 次失败后的等待为 `base × 2^(n-1)`，不超过 `cap`
#[derive(Builder, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// 最大尝试次数（含首次投递）
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 退避基数（毫秒）
    #[builder(default = DEFAULT_BACKOFF_BASE_MS)]
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 退避上限（毫秒）
    #[builder(default = DEFAULT_BACKOFF_CAP_MS)]
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
        }
    }
}

impl BackoffPolicy {
    /// 第 `attempt_count` 次失败之后的等待时长
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exp = attempt_count.saturating_sub(1).min(32);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.backoff_cap_ms))
    }

    /// 已达到尝试上限
    pub fn exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    fn validate(&self, owner: &str) -> CourierResult<()> {
        if self.max_attempts == 0 {
            return Err(CourierError::config(format!(
                "{owner}: max_attempts must be at least 1"
            )));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(CourierError::config(format!(
                "{owner}: backoff_cap_ms must not be below backoff_base_ms"
            )));
        }
        Ok(())
    }
}

/// 发布器配置
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[builder(into, default = DEFAULT_TOPIC.to_string())]
    #[serde(default = "default_topic")]
    pub topic: String,
    #[builder(default = publisher_retry())]
    #[serde(default = "publisher_retry")]
    pub retry: BackoffPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            retry: publisher_retry(),
        }
    }
}

/// 消费组配置
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// 消费组标识
    #[builder(into)]
    pub name: String,
    /// 订阅的主题
    #[builder(into, default = DEFAULT_TOPIC.to_string())]
    #[serde(default = "default_topic")]
    pub topic: String,
    /// 重投策略
    #[builder(default)]
    #[serde(flatten)]
    pub retry: BackoffPolicy,
    /// 单次处理超时（毫秒），超时视为失败
    #[builder(default = DEFAULT_HANDLER_TIMEOUT_MS)]
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::builder().name(name).topic(topic).build()
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn validate(&self) -> CourierResult<()> {
        if self.name.trim().is_empty() {
            return Err(CourierError::config("group name must not be empty"));
        }
        if self.topic.trim().is_empty() {
            return Err(CourierError::config(format!(
                "group {}: topic must not be empty",
                self.name
            )));
        }
        self.retry.validate(&self.name)
    }
}

/// 协调器配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// 分区发现间隔（毫秒）
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: default_discovery_interval_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(1))
    }
}

/// 顶层配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierConfig {
    /// 代理连接端点
    #[serde(default = "default_broker_endpoint")]
    pub broker_endpoint: String,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            broker_endpoint: default_broker_endpoint(),
            publisher: PublisherConfig::default(),
            coordinator: CoordinatorConfig::default(),
            groups: Vec::new(),
        }
    }
}

impl CourierConfig {
    pub fn from_toml_str(s: &str) -> CourierResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// 读取 TOML 文件（不存在时使用默认值），再以环境变量覆盖端点与主题
    ///
    /// - `COURIER_BROKER_ENDPOINT`
    /// - `COURIER_TOPIC`
    pub fn load(path: impl AsRef<Path>) -> CourierResult<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            toml::from_str::<Self>(&raw)?
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Self::default()
        };

        if let Some(endpoint) = env_non_empty("COURIER_BROKER_ENDPOINT") {
            config.broker_endpoint = endpoint;
        }
        if let Some(topic) = env_non_empty("COURIER_TOPIC") {
            config.publisher.topic = topic;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn validate(&self) -> CourierResult<()> {
        if self.publisher.topic.trim().is_empty() {
            return Err(CourierError::config("publisher topic must not be empty"));
        }
        self.publisher.retry.validate("publisher")?;
        for group in &self.groups {
            group.validate()?;
        }
        Ok(())
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_backoff_cap_ms() -> u64 {
    DEFAULT_BACKOFF_CAP_MS
}

fn default_handler_timeout_ms() -> u64 {
    DEFAULT_HANDLER_TIMEOUT_MS
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_broker_endpoint() -> String {
    "memory://local".to_string()
}

fn default_discovery_interval_ms() -> u64 {
    200
}

fn publisher_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: DEFAULT_MAX_ATTEMPTS,
        backoff_base_ms: 100,
        backoff_cap_ms: 5_000,
    }
}
