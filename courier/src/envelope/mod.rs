//! 事件信封（Envelope）与领域事件
//!
//! `DomainEvent` 是调用方交给发布器的业务事件；`EventEnvelope` 是发布器为其
//! 分配分区内序号后写入传输层的线上形态，携带路由与排序元数据。

mod domain_event;
mod event_envelope;

pub use domain_event::DomainEvent;
pub use event_envelope::EventEnvelope;
