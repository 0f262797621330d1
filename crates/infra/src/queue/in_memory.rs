use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::r#trait::{CommandQueue, DeadLetter, Delivery, QueueError};

#[derive(Debug)]
struct Entry {
    offset: u64,
    payload: String,
    acked: bool,
    attempts: u32,
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// Entries from the committed offset onwards.
    entries: VecDeque<Entry>,
    next_offset: u64,
    committed: u64,
}

impl PartitionLog {
    /// Drop acknowledged entries from the front and advance the committed offset.
    fn compact(&mut self) {
        while self.entries.front().is_some_and(|e| e.acked) {
            if let Some(entry) = self.entries.pop_front() {
                self.committed = entry.offset + 1;
            }
        }
    }
}

#[derive(Debug)]
struct Partition {
    log: Mutex<PartitionLog>,
    ready: Notify,
}

/// In-memory partitioned command log with offset semantics.
///
/// Intended for tests/dev: nothing survives a restart. Within that limit it
/// keeps the same contract as the durable backend: per-partition order,
/// redelivery of anything unacknowledged, and a committed offset that only
/// moves past contiguously acknowledged messages.
#[derive(Debug)]
pub struct InMemoryCommandQueue {
    partitions: Vec<Partition>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryCommandQueue {
    pub fn new(partitions: u32) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| Partition {
                log: Mutex::new(PartitionLog::default()),
                ready: Notify::new(),
            })
            .collect();

        Self {
            partitions,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Next offset a restarted consumer would read from.
    pub fn committed_offset(&self, partition: u32) -> Result<u64, QueueError> {
        Ok(self.log(partition)?.committed)
    }

    /// Messages not yet acknowledged on `partition`.
    pub fn pending(&self, partition: u32) -> Result<usize, QueueError> {
        Ok(self.log(partition)?.entries.iter().filter(|e| !e.acked).count())
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.dead_letters_guard()?.clone())
    }

    fn partition(&self, partition: u32) -> Result<&Partition, QueueError> {
        self.partitions
            .get(partition as usize)
            .ok_or(QueueError::UnknownPartition {
                partition,
                partitions: self.partitions.len() as u32,
            })
    }

    fn log(&self, partition: u32) -> Result<MutexGuard<'_, PartitionLog>, QueueError> {
        self.partition(partition)?
            .log
            .lock()
            .map_err(|_| QueueError::Unavailable("partition lock poisoned".to_string()))
    }

    fn dead_letters_guard(&self) -> Result<MutexGuard<'_, Vec<DeadLetter>>, QueueError> {
        self.dead_letters
            .lock()
            .map_err(|_| QueueError::Unavailable("dead letter lock poisoned".to_string()))
    }

    fn take_batch(&self, partition: u32, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut log = self.log(partition)?;
        let batch = log
            .entries
            .iter_mut()
            .filter(|e| !e.acked)
            .take(max)
            .map(|e| {
                e.attempts += 1;
                Delivery {
                    partition,
                    delivery_id: e.offset.to_string(),
                    payload: e.payload.clone(),
                    attempt: e.attempts,
                }
            })
            .collect();
        Ok(batch)
    }
}

#[async_trait]
impl CommandQueue for InMemoryCommandQueue {
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn enqueue(&self, partition: u32, payload: String) -> Result<String, QueueError> {
        let offset = {
            let mut log = self.log(partition)?;
            let offset = log.next_offset;
            log.next_offset += 1;
            log.entries.push_back(Entry {
                offset,
                payload,
                acked: false,
                attempts: 0,
            });
            offset
        };

        self.partition(partition)?.ready.notify_one();
        debug!(partition, offset, "command enqueued");
        Ok(offset.to_string())
    }

    async fn fetch(
        &self,
        partition: u32,
        _consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let batch = self.take_batch(partition, max)?;
        if !batch.is_empty() || wait.is_zero() {
            return Ok(batch);
        }

        let _ = tokio::time::timeout(wait, self.partition(partition)?.ready.notified()).await;
        self.take_batch(partition, max)
    }

    async fn ack(&self, partition: u32, delivery_id: &str) -> Result<(), QueueError> {
        let offset: u64 = delivery_id
            .parse()
            .map_err(|_| QueueError::Command(format!("invalid delivery id '{delivery_id}'")))?;

        let mut log = self.log(partition)?;
        if offset < log.committed {
            return Ok(());
        }
        match log.entries.iter_mut().find(|e| e.offset == offset) {
            Some(entry) => entry.acked = true,
            None => {
                return Err(QueueError::Command(format!(
                    "unknown delivery id '{delivery_id}' on partition {partition}"
                )));
            }
        }
        log.compact();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        self.partition(delivery.partition)?;
        self.dead_letters_guard()?.push(DeadLetter {
            partition: delivery.partition,
            delivery_id: delivery.delivery_id.clone(),
            payload: delivery.payload.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::ZERO;

    #[tokio::test]
    async fn unacked_messages_are_redelivered_from_the_oldest() {
        let q = InMemoryCommandQueue::new(2);
        for n in 0..3 {
            q.enqueue(1, format!("m{n}")).await.unwrap();
        }

        let first = q.fetch(1, "c", 10, NO_WAIT).await.unwrap();
        assert_eq!(first.len(), 3);
        q.ack(1, &first[0].delivery_id).await.unwrap();

        let again = q.fetch(1, "c", 10, NO_WAIT).await.unwrap();
        let payloads: Vec<&str> = again.iter().map(|d| d.payload.as_str()).collect();
        assert_eq!(payloads, vec!["m1", "m2"]);
        assert_eq!(again[0].attempt, 2);
        assert_eq!(q.committed_offset(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn committed_offset_only_moves_past_contiguous_acks() {
        let q = InMemoryCommandQueue::new(1);
        for n in 0..3 {
            q.enqueue(0, format!("m{n}")).await.unwrap();
        }
        let batch = q.fetch(0, "c", 10, NO_WAIT).await.unwrap();

        q.ack(0, &batch[2].delivery_id).await.unwrap();
        assert_eq!(q.committed_offset(0).unwrap(), 0);
        assert_eq!(q.pending(0).unwrap(), 2);

        q.ack(0, &batch[0].delivery_id).await.unwrap();
        q.ack(0, &batch[1].delivery_id).await.unwrap();
        assert_eq!(q.committed_offset(0).unwrap(), 3);
        assert!(q.fetch(0, "c", 10, NO_WAIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let q = InMemoryCommandQueue::new(2);
        q.enqueue(0, "a".into()).await.unwrap();
        q.enqueue(1, "b".into()).await.unwrap();

        let p0 = q.fetch(0, "c", 10, NO_WAIT).await.unwrap();
        assert_eq!(p0.len(), 1);
        assert_eq!(p0[0].payload, "a");
        assert!(matches!(
            q.enqueue(2, "x".into()).await,
            Err(QueueError::UnknownPartition { partition: 2, partitions: 2 })
        ));
    }

    #[tokio::test]
    async fn fetch_wakes_up_on_enqueue() {
        let q = std::sync::Arc::new(InMemoryCommandQueue::new(1));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.fetch(0, "c", 1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(0, "late".into()).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, "late");
    }

    #[tokio::test]
    async fn dead_letter_keeps_a_copy() {
        let q = InMemoryCommandQueue::new(1);
        q.enqueue(0, "garbage".into()).await.unwrap();
        let d = q.fetch(0, "c", 1, NO_WAIT).await.unwrap().remove(0);

        q.dead_letter(&d, "undecodable").await.unwrap();
        q.ack(0, &d.delivery_id).await.unwrap();

        let dlq = q.dead_letters().unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].payload, "garbage");
        assert_eq!(q.pending(0).unwrap(), 0);
    }
}
