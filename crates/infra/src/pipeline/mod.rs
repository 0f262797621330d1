//! Asynchronous deposit pipeline: producer → command queue → consumer.
//!
//! State of one command: `Requested → (enqueued) → Processing →
//! {Completed | Duplicate | PermanentlyFailed}`. A transient failure sends it
//! back to `Requested` through redelivery; it leaves the queue only once acked.

pub mod consumer;
pub mod outcome;
pub mod producer;

use serde::Serialize;

pub use consumer::{ConsumerConfig, ConsumerGroup, ConsumerStats, DepositConsumer};
pub use outcome::CommandState;
pub use producer::{DepositProducer, EnqueueError, ProducerConfig, ProducerStats};

/// Combined producer/consumer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub producer: ProducerStats,
    pub consumer: ConsumerStats,
}
