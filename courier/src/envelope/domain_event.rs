use bon::Builder;
use serde::Serialize;
use serde_json::Value;

/// 待发布的领域事件：类型、分区键与负载
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct DomainEvent {
    #[builder(into)]
    event_type: String,
    #[builder(into)]
    partition_key: String,
    #[builder(default = Value::Null)]
    payload: Value,
}

impl DomainEvent {
    pub fn new(
        event_type: impl Into<String>,
        partition_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            partition_key: partition_key.into(),
            payload,
        }
    }

    /// 由任意可序列化的业务结构构建事件
    pub fn from_serializable<T: Serialize>(
        event_type: impl Into<String>,
        partition_key: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            event_type,
            partition_key,
            serde_json::to_value(payload)?,
        ))
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub(crate) fn into_parts(self) -> (String, String, Value) {
        (self.event_type, self.partition_key, self.payload)
    }
}
