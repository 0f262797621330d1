use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use ledgerline_core::{DepositOutcome, LedgerError};
use ledgerline_events::{DepositCommand, EventBus, LedgerEvent};

use super::outcome::CommandState;
use crate::queue::{CommandQueue, Delivery, QueueError};
use crate::store::LedgerStore;

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    /// Longest wait for new commands in one fetch.
    pub poll_interval: Duration,
    /// Pause before refetching after a retryable failure.
    pub retry_backoff: Duration,
    /// Consumer name prefix; the partition number is appended.
    pub name_prefix: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            poll_interval: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(500),
            name_prefix: "ledger-consumer".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    completed: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    queue_errors: AtomicU64,
}

impl ConsumerCounters {
    fn record(&self, state: CommandState) {
        let counter = match state {
            CommandState::Completed => &self.completed,
            CommandState::Duplicate => &self.duplicates,
            CommandState::PermanentlyFailed => &self.failed,
            CommandState::Poisoned => &self.dead_lettered,
            CommandState::Retry => &self.retried,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            completed: self.completed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time consumer counters, summed over all partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub completed: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub queue_errors: u64,
}

/// At-least-once deposit consumer.
///
/// Reads commands with manual acknowledgment and applies them through the
/// store's idempotent deposit. See [`CommandState`] for the per-outcome
/// ack/retry decision.
///
/// ## Ordering
///
/// A retryable failure ends the current batch: the consumer backs off and
/// fetches again from the oldest unacknowledged command, so commands of one
/// partition are never applied out of order.
///
/// ## Shutdown
///
/// The in-flight command is finished (and acked if its outcome says so), then
/// the worker stops claiming new ones. Anything unacknowledged stays queued.
#[derive(Debug)]
pub struct DepositConsumer<S, Q, B> {
    store: S,
    queue: Q,
    bus: B,
    config: ConsumerConfig,
    counters: Arc<ConsumerCounters>,
}

impl<S, Q, B> DepositConsumer<S, Q, B>
where
    S: LedgerStore + 'static,
    Q: CommandQueue + 'static,
    B: EventBus<LedgerEvent> + 'static,
{
    pub fn new(store: S, queue: Q, bus: B, config: ConsumerConfig) -> Self {
        Self {
            store,
            queue,
            bus,
            config,
            counters: Arc::new(ConsumerCounters::default()),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Process one delivery and settle it with the queue.
    #[instrument(
        skip(self, delivery),
        fields(
            partition = delivery.partition,
            delivery_id = %delivery.delivery_id,
            attempt = delivery.attempt
        )
    )]
    pub async fn handle(&self, delivery: &Delivery) -> Result<CommandState, QueueError> {
        let command = match DepositCommand::decode(&delivery.payload) {
            Ok(command) => command,
            Err(err) => {
                error!(error = %err, "undecodable deposit command");
                self.queue
                    .dead_letter(delivery, &format!("undecodable payload: {err}"))
                    .await?;
                self.queue
                    .ack(delivery.partition, &delivery.delivery_id)
                    .await?;
                self.counters.record(CommandState::Poisoned);
                return Ok(CommandState::Poisoned);
            }
        };

        let result = self
            .store
            .deposit(command.account_id, command.amount, &command.idempotency_key)
            .await;
        let state = CommandState::from_result(&result);

        match &result {
            Ok(DepositOutcome::Applied(account)) | Ok(DepositOutcome::Duplicate(account)) => {
                debug!(
                    operation_id = %command.operation_id,
                    account_id = %account.id,
                    balance = account.balance,
                    %state,
                    "deposit settled"
                );
            }
            Err(err) if state.emits_failure() => {
                warn!(operation_id = %command.operation_id, error = %err, "deposit permanently failed");
                self.publish_failure(&command, err);
            }
            Err(err) => {
                warn!(operation_id = %command.operation_id, error = %err, "deposit failed; will be redelivered");
            }
        }

        if state.acknowledges() {
            self.queue
                .ack(delivery.partition, &delivery.delivery_id)
                .await?;
        }

        self.counters.record(state);
        Ok(state)
    }

    /// Consume one partition until `shutdown` flips to `true`.
    pub async fn run_partition(&self, partition: u32, mut shutdown: watch::Receiver<bool>) {
        let consumer = format!("{}-{partition}", self.config.name_prefix);
        info!(partition, %consumer, "deposit consumer started");

        'poll: while !*shutdown.borrow() {
            let fetched = tokio::select! {
                _ = shutdown.changed() => break 'poll,
                fetched = self.queue.fetch(
                    partition,
                    &consumer,
                    self.config.batch_size,
                    self.config.poll_interval,
                ) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(err) => {
                    self.counters.queue_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(partition, error = %err, "fetch failed");
                    if self.back_off(&mut shutdown).await {
                        break 'poll;
                    }
                    continue 'poll;
                }
            };

            for delivery in &batch {
                match self.handle(delivery).await {
                    Ok(CommandState::Retry) => {
                        if self.back_off(&mut shutdown).await {
                            break 'poll;
                        }
                        continue 'poll;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.counters.queue_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(partition, error = %err, "could not settle delivery");
                        if self.back_off(&mut shutdown).await {
                            break 'poll;
                        }
                        continue 'poll;
                    }
                }

                if *shutdown.borrow() {
                    break 'poll;
                }
            }
        }

        info!(partition, %consumer, "deposit consumer stopped");
    }

    /// Start one worker per queue partition.
    pub fn spawn(self: Arc<Self>) -> ConsumerGroup {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let workers = (0..self.queue.partitions())
            .map(|partition| {
                let consumer = self.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { consumer.run_partition(partition, shutdown_rx).await })
            })
            .collect();

        ConsumerGroup {
            shutdown,
            workers,
            counters: self.counters.clone(),
        }
    }

    fn publish_failure(&self, command: &DepositCommand, err: &LedgerError) {
        let event = LedgerEvent::failed(
            command.account_id,
            command.amount.get(),
            command.operation_id,
            err.to_string(),
        );
        if let Err(publish_err) = self.bus.publish(event) {
            warn!(error = %publish_err, "transaction failure event not published");
        }
    }

    /// Sleep for the retry backoff. Returns `true` if shutdown was requested.
    async fn back_off(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_backoff) => *shutdown.borrow(),
            _ = shutdown.changed() => true,
        }
    }
}

/// Handle to the running per-partition consumers.
#[derive(Debug)]
pub struct ConsumerGroup {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<ConsumerCounters>,
}

impl ConsumerGroup {
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Request graceful shutdown and wait for every worker to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
