//! 可靠事件投递核心（courier）
//!
//! 位于通用发布/订阅传输之上的客户端投递核心：
//! - 事件信封（`envelope`）：带分区键与分区内序号的线上形态；
//! - 发布器：至少一次发布、分区序号分配、传输失败的指数退避重试；
//! - 消费组协调器：多组扇出、组间游标隔离、分区内严格有序；
//! - 重投调度器：有界重试、退避与死信；
//! - 可注入的可观测性接收器（`observer`）与面向运维的配置（`config`）。
//!
//! 本 crate 不实现代理本身，传输层与死信接收器均以 trait 形式注入，
//! 以便在不同基础设施（例如 Kafka、RabbitMQ 等）上进行适配实现。
//!
//! 典型用法：
//! 1. 构造 `Transport` 与 `DeadLetterSink` 实现；
//! 2. 启动 `RedeliveryScheduler`，以其构造 `ConsumerGroupCoordinator`；
//! 3. 通过 `register_group` 显式注册每个业务消费组及其 `DeliveryHandler`；
//! 4. `start` 协调器，使用 `Publisher::publish` 发布领域事件。
//!
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod observer;
