use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use ledgerline_core::OperationId;
use ledgerline_events::DepositCommand;

use crate::queue::CommandQueue;

/// Producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Commands accepted but not yet written to the queue.
    pub buffer: usize,
    /// How long `enqueue` waits for buffer space before dropping the command.
    pub enqueue_timeout: Duration,
    /// Queue write attempts per buffered command once shutdown has begun.
    /// Before that, writes are retried until they succeed.
    pub max_write_attempts: u32,
    /// First retry delay; doubles per attempt up to `MAX_WRITE_BACKOFF`.
    pub write_backoff: Duration,
}

/// Upper bound on the delay between queue write retries.
pub const MAX_WRITE_BACKOFF: Duration = Duration::from_secs(5);

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            buffer: 1024,
            enqueue_timeout: Duration::from_millis(100),
            max_write_attempts: 3,
            write_backoff: Duration::from_millis(50),
        }
    }
}

impl ProducerConfig {
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    pub fn with_write_backoff(mut self, backoff: Duration) -> Self {
        self.write_backoff = backoff;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.write_backoff.saturating_mul(factor).min(MAX_WRITE_BACKOFF)
    }
}

/// Why `DepositProducer::enqueue` refused a command.
///
/// `Ok` from `enqueue` means the command is buffered, not yet durably queued.
/// Buffered commands are written with retries until shutdown; only commands
/// still failing after shutdown begins are lost (counted in
/// `ProducerStats::failed`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The buffer stayed full for the whole enqueue timeout. The command was
    /// not accepted; the caller may retry.
    #[error("producer buffer full; command {operation_id} dropped")]
    Dropped { operation_id: OperationId },

    #[error("producer is shut down")]
    Closed,

    #[error("command serialization failed: {0}")]
    Serialization(String),
}

#[derive(Debug, Default)]
struct ProducerCounters {
    accepted: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time producer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    /// Taken into the buffer.
    pub accepted: u64,
    /// Written to the queue.
    pub enqueued: u64,
    /// Rejected because the buffer was full.
    pub dropped: u64,
    /// Buffered but still unwritten when shutdown gave up on it.
    pub failed: u64,
}

#[derive(Debug)]
struct Outgoing {
    partition: u32,
    payload: String,
    operation_id: OperationId,
}

/// Asynchronous deposit command producer.
///
/// `enqueue` only waits for buffer space (bounded by the enqueue timeout); a
/// background task writes buffered commands to the queue partition of their
/// account.
#[derive(Debug)]
pub struct DepositProducer {
    sender: mpsc::Sender<Outgoing>,
    partitions: u32,
    enqueue_timeout: Duration,
    counters: Arc<ProducerCounters>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DepositProducer {
    pub fn spawn<Q>(queue: Q, config: ProducerConfig) -> Self
    where
        Q: CommandQueue + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.buffer.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(ProducerCounters::default());
        let partitions = queue.partitions();
        let enqueue_timeout = config.enqueue_timeout;

        let task = tokio::spawn(forward(
            queue,
            receiver,
            shutdown_rx,
            config,
            counters.clone(),
        ));

        Self {
            sender,
            partitions,
            enqueue_timeout,
            counters,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    #[instrument(
        skip(self, command),
        fields(operation_id = %command.operation_id, account_id = %command.account_id),
        err
    )]
    pub async fn enqueue(&self, command: &DepositCommand) -> Result<(), EnqueueError> {
        let payload = command
            .encode()
            .map_err(|e| EnqueueError::Serialization(e.to_string()))?;
        let outgoing = Outgoing {
            partition: command.partition(self.partitions),
            payload,
            operation_id: command.operation_id,
        };

        match self.sender.send_timeout(outgoing, self.enqueue_timeout).await {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(rejected)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(partition = rejected.partition, "producer buffer full; command dropped");
                Err(EnqueueError::Dropped {
                    operation_id: rejected.operation_id,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting commands, write out what is buffered, then stop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn forward<Q: CommandQueue>(
    queue: Q,
    mut receiver: mpsc::Receiver<Outgoing>,
    mut shutdown: watch::Receiver<bool>,
    config: ProducerConfig,
    counters: Arc<ProducerCounters>,
) {
    let mut closing = false;

    loop {
        tokio::select! {
            next = receiver.recv() => match next {
                Some(outgoing) => write(&queue, outgoing, &config, &counters, &shutdown).await,
                None => break,
            },
            _ = shutdown.changed(), if !closing => {
                // Buffered commands are still delivered; new sends fail.
                closing = true;
                receiver.close();
            }
        }
    }

    info!("deposit producer stopped");
}

async fn write<Q: CommandQueue>(
    queue: &Q,
    outgoing: Outgoing,
    config: &ProducerConfig,
    counters: &ProducerCounters,
    shutdown: &watch::Receiver<bool>,
) {
    let final_attempts = config.max_write_attempts.max(1);
    let mut attempt = 0u32;
    let mut attempts_while_closing = 0u32;

    loop {
        attempt += 1;
        let err = match queue
            .enqueue(outgoing.partition, outgoing.payload.clone())
            .await
        {
            Ok(delivery_id) => {
                counters.enqueued.fetch_add(1, Ordering::Relaxed);
                debug!(
                    operation_id = %outgoing.operation_id,
                    partition = outgoing.partition,
                    %delivery_id,
                    "deposit command enqueued"
                );
                return;
            }
            Err(err) => err,
        };

        if *shutdown.borrow() {
            attempts_while_closing += 1;
            if attempts_while_closing >= final_attempts {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(operation_id = %outgoing.operation_id, attempt, error = %err, "queue write failed at shutdown; command lost");
                return;
            }
        }

        warn!(operation_id = %outgoing.operation_id, attempt, error = %err, "queue write failed; retrying");
        tokio::time::sleep(config.backoff(attempt)).await;
    }
}
