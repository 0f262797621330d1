use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// One delivery of a queued message.
///
/// A message stays in the queue until acknowledged; fetching again before that
/// returns it again (at-least-once).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    /// Backend position: an offset for the in-memory log, a stream entry id for Redis.
    pub delivery_id: String,
    pub payload: String,
    /// How many times this message has been handed out, including this one.
    pub attempt: u32,
}

/// A message moved aside because it can never be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub partition: u32,
    pub delivery_id: String,
    pub payload: String,
    pub reason: String,
}

/// Command queue operation error. Always retryable from the consumer's view.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("unknown partition {partition} (queue has {partitions})")]
    UnknownPartition { partition: u32, partitions: u32 },

    #[error("queue state unavailable: {0}")]
    Unavailable(String),
}

/// Durable, partition-ordered command channel with manual acknowledgment.
///
/// ## Delivery contract
///
/// - Messages on one partition are handed out in enqueue order.
/// - `fetch` always starts at the oldest unacknowledged message of the partition,
///   so anything not acked (crash, retry, restart) is delivered again.
/// - Nothing is removed until `ack` is called for it.
/// - `dead_letter` copies a message aside; the caller still acks the original.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    fn partitions(&self) -> u32;

    /// Append `payload` to `partition`; returns its delivery id.
    async fn enqueue(&self, partition: u32, payload: String) -> Result<String, QueueError>;

    /// Up to `max` deliveries for `consumer`, waiting at most `wait` when the
    /// partition is empty.
    async fn fetch(
        &self,
        partition: u32,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, partition: u32, delivery_id: &str) -> Result<(), QueueError>;

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> CommandQueue for Arc<Q>
where
    Q: CommandQueue + ?Sized,
{
    fn partitions(&self) -> u32 {
        (**self).partitions()
    }

    async fn enqueue(&self, partition: u32, payload: String) -> Result<String, QueueError> {
        (**self).enqueue(partition, payload).await
    }

    async fn fetch(
        &self,
        partition: u32,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        (**self).fetch(partition, consumer, max, wait).await
    }

    async fn ack(&self, partition: u32, delivery_id: &str) -> Result<(), QueueError> {
        (**self).ack(partition, delivery_id).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        (**self).dead_letter(delivery, reason).await
    }
}
