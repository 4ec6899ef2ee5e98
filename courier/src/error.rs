//! 投递核心统一错误定义
//!
//! 分为三类：
//! - `CourierError`：传输、死信、注册与状态机等基础设施错误；
//! - `PublishError`：发布侧错误，传输失败在本地重试，仅在耗尽重试后向调用方暴露；
//! - `FailureReason`：消费侧失败原因，交由重投调度器处理，不会使协调器崩溃。
//!
use thiserror::Error;

/// 统一错误类型（基础设施侧）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CourierError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 外部协作方 ---
    #[error("transport error: {reason}")]
    Transport { reason: String },
    #[error("dead letter sink error: {reason}")]
    DeadLetter { reason: String },

    // --- 消费组 ---
    #[error("consumer group already registered: {name}")]
    GroupAlreadyRegistered { name: String },
    #[error("consumer group not found: {name}")]
    GroupNotFound { name: String },
    #[error("consumer group already dispatching: {name}")]
    GroupAlreadyRunning { name: String },

    // --- 投递状态机 ---
    #[error("invalid delivery attempt transition: from={from}, to={to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("redelivery scheduler stopped")]
    SchedulerStopped,

    // --- 配置 ---
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl CourierError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Self::DeadLetter {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for CourierError {
    fn from(err: toml::de::Error) -> Self {
        CourierError::Config {
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Config {
            reason: err.to_string(),
        }
    }
}

/// 统一 Result 类型别名
pub type CourierResult<T> = Result<T, CourierError>;

/// 发布侧错误
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("partition key must not be empty")]
    EmptyPartitionKey,
    #[error("failed to serialize event payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport unavailable after {attempts} attempts: {source}")]
    TransportUnavailable {
        attempts: u32,
        #[source]
        source: CourierError,
    },
}

/// 消费侧失败原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// 业务处理失败（handler 返回 Nack）
    #[error("handler failure: {0}")]
    HandlerFailure(String),
    /// 处理超时，与 HandlerFailure 同等对待
    #[error("handler timeout")]
    HandlerTimeout,
    /// 同一信封在重试上限内持续失败，转入死信
    #[error("poison message after {attempts} attempts, last failure: {last}")]
    PoisonMessage {
        attempts: u32,
        last: Box<FailureReason>,
    },
}
