//! Redis Streams-backed command queue (durable, at-least-once delivery).
//!
//! - **Stream per partition**: `ledger:deposits:{p}`
//! - **Consumer group**: `ledger-consumers`, created from `0` with `MKSTREAM`
//! - **Manual ack**: entries stay in the group's pending list until `XACK`
//! - **Restart safety**: a consumer first re-reads its own pending entries
//!   (`0`), then new ones (`>`), so nothing read-but-unacked is skipped
//! - **Dead letters**: `ledger:deposits:dlq`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use tracing::{debug, info, instrument, warn};

use super::r#trait::{CommandQueue, Delivery, QueueError};

/// Default stream key prefix.
const DEFAULT_STREAM_PREFIX: &str = "ledger:deposits";

/// Consumer group shared by all ledger consumers.
const CONSUMER_GROUP: &str = "ledger-consumers";

pub struct RedisStreamsQueue {
    conn: MultiplexedConnection,
    stream_prefix: String,
    dlq_key: String,
    partitions: u32,
}

impl core::fmt::Debug for RedisStreamsQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsQueue")
            .field("stream_prefix", &self.stream_prefix)
            .field("dlq_key", &self.dlq_key)
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsQueue {
    /// Connect and make sure every partition stream has the consumer group.
    ///
    /// * `redis_url` - e.g. "redis://localhost:6379"
    /// * `stream_prefix` - default "ledger:deposits"; the dead-letter stream is `{prefix}:dlq`
    pub async fn connect(
        redis_url: &str,
        partitions: u32,
        stream_prefix: Option<String>,
    ) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let stream_prefix = stream_prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string());
        let queue = Self {
            conn,
            dlq_key: format!("{stream_prefix}:dlq"),
            stream_prefix,
            partitions: partitions.max(1),
        };

        for partition in 0..queue.partitions {
            queue.ensure_consumer_group(partition).await?;
        }
        info!(
            prefix = %queue.stream_prefix,
            partitions = queue.partitions,
            "redis command queue ready"
        );
        Ok(queue)
    }

    pub fn stream_key(&self, partition: u32) -> String {
        format!("{}:{partition}", self.stream_prefix)
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    /// Create the group from the start of the stream. Existing groups are kept.
    async fn ensure_consumer_group(&self, partition: u32) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(self.stream_key(partition), CONSUMER_GROUP, "0")
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn check_partition(&self, partition: u32) -> Result<(), QueueError> {
        if partition >= self.partitions {
            return Err(QueueError::UnknownPartition {
                partition,
                partitions: self.partitions,
            });
        }
        Ok(())
    }

    /// Entries this consumer has read but not acknowledged.
    async fn read_pending(
        &self,
        partition: u32,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let key = self.stream_key(partition);
        let mut conn = self.conn.clone();

        let pending: StreamPendingCountReply = conn
            .xpending_consumer_count(&key, CONSUMER_GROUP, "-", "+", max, consumer)
            .await
            .map_err(|e| command_error("XPENDING", e))?;
        if pending.ids.is_empty() {
            return Ok(vec![]);
        }
        let attempts: HashMap<String, usize> = pending
            .ids
            .into_iter()
            .map(|p| (p.id, p.times_delivered))
            .collect();

        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(max);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&key], &["0"], &options)
            .await
            .map_err(|e| command_error("XREADGROUP 0", e))?;

        Ok(to_deliveries(partition, reply, |id| {
            attempts.get(id).copied().unwrap_or(1) as u32
        }))
    }

    /// New entries for the group, blocking up to `wait`.
    async fn read_new(
        &self,
        partition: u32,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let key = self.stream_key(partition);
        let mut conn = self.conn.clone();

        let mut options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(max);
        // BLOCK 0 would wait forever.
        if !wait.is_zero() {
            options = options.block(wait.as_millis().max(1) as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&key], &[">"], &options)
            .await
            .map_err(|e| command_error("XREADGROUP >", e))?;

        Ok(to_deliveries(partition, reply, |_| 1))
    }
}

#[async_trait]
impl CommandQueue for RedisStreamsQueue {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    #[instrument(skip(self, payload), fields(stream = %self.stream_key(partition)), err)]
    async fn enqueue(&self, partition: u32, payload: String) -> Result<String, QueueError> {
        self.check_partition(partition)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(self.stream_key(partition), "*", &[("payload", payload.as_str())])
            .await
            .map_err(|e| command_error("XADD", e))?;
        Ok(id)
    }

    async fn fetch(
        &self,
        partition: u32,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        self.check_partition(partition)?;

        // Read pending entries first (unacknowledged messages)
        let pending = self.read_pending(partition, consumer, max).await?;
        if !pending.is_empty() {
            debug!(partition, count = pending.len(), "redelivering pending entries");
            return Ok(pending);
        }

        self.read_new(partition, consumer, max, wait).await
    }

    async fn ack(&self, partition: u32, delivery_id: &str) -> Result<(), QueueError> {
        self.check_partition(partition)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(self.stream_key(partition), CONSUMER_GROUP, &[delivery_id])
            .await
            .map_err(|e| command_error("XACK", e))?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let fields = [
            ("partition", delivery.partition.to_string()),
            ("original_message_id", delivery.delivery_id.clone()),
            ("attempt", delivery.attempt.to_string()),
            ("reason", reason.to_string()),
            ("failed_at", chrono::Utc::now().to_rfc3339()),
            ("payload", delivery.payload.clone()),
        ];
        let _: String = conn
            .xadd(&self.dlq_key, "*", &fields)
            .await
            .map_err(|e| command_error("DLQ XADD", e))?;

        warn!(
            partition = delivery.partition,
            message_id = %delivery.delivery_id,
            %reason,
            "message sent to dead-letter stream"
        );
        Ok(())
    }
}

fn to_deliveries(
    partition: u32,
    reply: Option<StreamReadReply>,
    attempt: impl Fn(&str) -> u32,
) -> Vec<Delivery> {
    reply
        .into_iter()
        .flat_map(|r| r.keys)
        .flat_map(|k| k.ids)
        .map(|entry| Delivery {
            partition,
            attempt: attempt(&entry.id),
            // A trimmed entry comes back without fields; it decodes as poison.
            payload: entry.get::<String>("payload").unwrap_or_default(),
            delivery_id: entry.id,
        })
        .collect()
}

fn command_error(command: &str, err: redis::RedisError) -> QueueError {
    if err.is_connection_dropped() || err.is_io_error() || err.is_connection_refusal() {
        QueueError::Connection(format!("{command} failed: {err}"))
    } else {
        QueueError::Command(format!("{command} failed: {err}"))
    }
}
