//! Infrastructure layer: account stores, command queues, the deposit pipeline
//! and process configuration.

pub mod config;
pub mod pipeline;
pub mod queue;
pub mod store;

pub use config::{ConfigError, LedgerConfig};
pub use pipeline::{
    CommandState, ConsumerConfig, ConsumerGroup, ConsumerStats, DepositConsumer, DepositProducer,
    EnqueueError, PipelineStats, ProducerConfig, ProducerStats,
};
pub use queue::{CommandQueue, DeadLetter, Delivery, InMemoryCommandQueue, QueueError};
#[cfg(feature = "redis")]
pub use queue::RedisStreamsQueue;
pub use store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, PublishingLedgerStore};
