use crate::error::CourierResult;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

/// 事件信封：线上传输的标准形态
///
/// `sequence_id` 在同一 `partition_key` 内严格递增（从 1 开始），
/// 消费端据此检测空洞与重复。
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// 事件唯一标识
    #[builder(default = Uuid::new_v4())]
    event_id: Uuid,
    /// 事件类型
    #[builder(into)]
    event_type: String,
    /// 事件负载
    #[builder(default = Value::Null)]
    payload: Value,
    /// 分区键，仅在分区内保证全序
    #[builder(into)]
    partition_key: String,
    /// 生产时间
    #[builder(default = Utc::now())]
    produced_at: DateTime<Utc>,
    /// 分区内序号
    sequence_id: u64,
}

impl EventEnvelope {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// 将负载反序列化为具体业务类型
    pub fn payload_as<T: DeserializeOwned>(&self) -> CourierResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// 编码为线上字节（JSON）
    pub fn to_wire(&self) -> CourierResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 从线上字节解码
    pub fn from_wire(bytes: &[u8]) -> CourierResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
