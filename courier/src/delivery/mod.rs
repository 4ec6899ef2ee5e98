//! 投递子系统（delivery）
//!
//! 提供可靠事件投递的协议与运行时：
//! - `Transport`：有序、持久、多消费组的日志原语（外部协作方）；
//! - `Publisher`：分配分区序号并带退避重试地追加信封；
//! - `ConsumerGroupCoordinator`：按组、按分区维护游标并串行分发；
//! - `DeliveryHandler`：业务消费方的处理协议；
//! - `RedeliveryScheduler`：失败重投、退避与死信；
//! - `DeadLetterSink`：死信终点（外部协作方）。
//!
//! 该模块不绑定具体代理实现，内置的内存实现用于测试、示例与本地开发。
//!
pub mod attempt;
pub mod coordinator;
pub mod dead_letter;
pub mod group;
pub mod handler;
pub mod publisher;
pub mod scheduler;
pub mod transport;
pub mod transport_inmemory;

pub use attempt::{AttemptState, DeliveryAttempt, RetryDecision};
pub use coordinator::{ConsumerGroupCoordinator, CoordinatorHandle};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink};
pub use group::{ConsumerGroup, CursorSlot, GroupSnapshot};
pub use handler::{DeliveryHandler, Outcome};
pub use publisher::{PublishReceipt, Publisher};
pub use scheduler::{RedeliveryRequest, RedeliveryScheduler, Resolution};
pub use transport::Transport;
pub use transport_inmemory::InMemoryTransport;
