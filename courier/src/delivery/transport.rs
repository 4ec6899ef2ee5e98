//! 传输层（Transport）协议
//!
//! 有序、持久、可被多个消费组读取的日志/队列原语。代理自身的存储与复制
//! 被视为黑盒，这里只约定客户端所需的最小接口。
//!
use crate::{envelope::EventEnvelope, error::CourierResult as Result};
use async_trait::async_trait;
use futures_core::stream::BoxStream;

/// 传输层：按主题与分区键追加与读取信封
#[async_trait]
pub trait Transport: Send + Sync {
    /// 持久追加，返回该信封在分区内的偏移
    async fn append(&self, topic: &str, partition_key: &str, envelope: &EventEnvelope)
    -> Result<u64>;

    /// 从 `offset` 开始读取分区：
    /// 对当前日志有限，随新条目追加而逻辑上无限，可从任意偏移重新开始
    async fn read_from(
        &self,
        topic: &str,
        partition_key: &str,
        offset: u64,
    ) -> BoxStream<'static, Result<EventEnvelope>>;

    /// 主题下当前已知的分区键
    async fn partitions(&self, topic: &str) -> Result<Vec<String>>;

    /// 分区内已追加的最大序号，用于发布器恢复序号计数
    async fn last_sequence(&self, topic: &str, partition_key: &str) -> Result<Option<u64>>;
}
