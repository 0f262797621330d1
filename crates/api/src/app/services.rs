use std::{convert::Infallible, sync::Arc, sync::Mutex, time::Duration};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use serde::Serialize;
use thiserror::Error;
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};

use ledgerline_core::{
    Account, AccountId, Amount, IdempotencyKey, LedgerError, LedgerResult,
    TransactionRecord, TransferReceipt,
};
use ledgerline_events::{
    DepositCommand, Event, EventBroker, EventBus, LedgerEvent, SubscriberId, Subscription,
};
use ledgerline_infra::{
    CommandQueue, ConfigError, ConsumerGroup, DepositConsumer, DepositProducer, EnqueueError,
    InMemoryCommandQueue, InMemoryLedgerStore, LedgerConfig, LedgerStore, PipelineStats,
    PublishingLedgerStore, QueueError,
    store::{DEFAULT_HISTORY_LIMIT, clamp_history_limit},
};

#[cfg(feature = "redis")]
use ledgerline_infra::{PostgresLedgerStore, RedisStreamsQueue};

type SharedStore = Arc<dyn LedgerStore>;
type SharedQueue = Arc<dyn CommandQueue>;
type Broker = Arc<EventBroker<LedgerEvent>>;
type Consumer = DepositConsumer<SharedStore, SharedQueue, Broker>;

/// Which storage/queue pair the process runs on. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    InMemory,
    Persistent,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store setup failed: {0}")]
    Store(#[from] LedgerError),

    #[error("queue setup failed: {0}")]
    Queue(#[from] QueueError),

    #[error("USE_PERSISTENT_STORES=true but this build lacks the `redis` feature")]
    PersistentUnavailable,
}

/// Process-wide services, built once and shared by every request.
///
/// Every balance change goes through `store`, which publishes committed
/// changes to `broker`. Deposits take the asynchronous path: `producer`
/// queues them and the consumer group applies them.
pub struct AppServices {
    backend: Backend,
    store: SharedStore,
    broker: Broker,
    producer: DepositProducer,
    consumer: Arc<Consumer>,
    consumers: Mutex<Option<ConsumerGroup>>,
}

impl core::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppServices")
            .field("backend", &self.backend)
            .field("producer", &self.producer)
            .finish_non_exhaustive()
    }
}

pub async fn build_services(config: &LedgerConfig) -> Result<AppServices, BuildError> {
    if config.persistent {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            return Err(BuildError::PersistentUnavailable);
        }
    }

    Ok(build_in_memory_services(config))
}

pub fn build_in_memory_services(config: &LedgerConfig) -> AppServices {
    let store: SharedStore = Arc::new(InMemoryLedgerStore::new());
    let queue: SharedQueue = Arc::new(InMemoryCommandQueue::new(config.partitions));
    assemble(Backend::InMemory, store, queue, config)
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &LedgerConfig) -> Result<AppServices, BuildError> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or(ConfigError::Missing { key: "DATABASE_URL" })?;
    let redis_url = config
        .redis_url
        .as_deref()
        .ok_or(ConfigError::Missing { key: "REDIS_URL" })?;

    let postgres = PostgresLedgerStore::connect(database_url, config.db_max_connections).await?;
    postgres.ensure_schema().await?;
    let queue = RedisStreamsQueue::connect(redis_url, config.partitions, None).await?;

    Ok(assemble(
        Backend::Persistent,
        Arc::new(postgres),
        Arc::new(queue),
        config,
    ))
}

fn assemble(
    backend: Backend,
    store: SharedStore,
    queue: SharedQueue,
    config: &LedgerConfig,
) -> AppServices {
    let broker: Broker = Arc::new(EventBroker::spawn(config.broker_buffer));
    let store: SharedStore = Arc::new(PublishingLedgerStore::new(store, broker.clone()));

    let producer = DepositProducer::spawn(queue.clone(), config.producer.clone());
    let consumer = Arc::new(DepositConsumer::new(
        store.clone(),
        queue,
        broker.clone(),
        config.consumer.clone(),
    ));
    let group = consumer.clone().spawn();

    tracing::info!(
        ?backend,
        partitions = group.workers(),
        "ledger services started"
    );

    AppServices {
        backend,
        store,
        broker,
        producer,
        consumer,
        consumers: Mutex::new(Some(group)),
    }
}

impl AppServices {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub async fn create_account(&self, owner: &str) -> LedgerResult<AccountId> {
        self.store.create_account(owner).await
    }

    pub async fn get_account(&self, id: AccountId) -> LedgerResult<Account> {
        self.store.get_account(id).await
    }

    pub async fn withdraw(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        self.store.withdraw(id, amount).await
    }

    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferReceipt> {
        self.store.transfer(from, to, amount).await
    }

    pub async fn list_transactions(
        &self,
        id: AccountId,
        limit: Option<u32>,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        let limit = clamp_history_limit(limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
        self.store.list_transactions(id, limit).await
    }

    /// Queue a deposit. Without a caller token the key is derived from
    /// (account, amount), so equal deposits collapse into one.
    pub async fn request_deposit(
        &self,
        id: AccountId,
        amount: Amount,
        caller_token: Option<&str>,
    ) -> Result<DepositCommand, EnqueueError> {
        let command = match caller_token {
            Some(token) => {
                DepositCommand::with_key(id, amount, IdempotencyKey::from_caller_token(id, token))
            }
            None => DepositCommand::new(id, amount),
        };
        self.producer.enqueue(&command).await?;
        Ok(command)
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        PipelineStats {
            producer: self.producer.stats(),
            consumer: self.consumer.stats(),
        }
    }

    pub fn subscribe(&self) -> Subscription<LedgerEvent> {
        self.broker.subscribe()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.broker.subscriber_count().await.unwrap_or(0)
    }

    pub async fn reset(&self) -> LedgerResult<()> {
        tracing::warn!("resetting ledger state");
        self.store.reset().await
    }

    /// Stop in dependency order: no new commands, drain the consumers, then
    /// close event subscriptions.
    pub async fn shutdown(&self) {
        self.producer.shutdown().await;

        let group = self.consumers.lock().ok().and_then(|mut g| g.take());
        if let Some(group) = group {
            group.shutdown().await;
        }

        self.broker.shutdown().await;
        tracing::info!("ledger services stopped");
    }
}

/// SSE stream of broker events, optionally restricted to one account.
pub fn ledger_sse_stream(
    services: &AppServices,
    account: Option<AccountId>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>> + use<>> {
    let subscription = services.subscribe();
    let subscriber = subscription.id();
    let stream = BroadcastStream::new(subscription.into_receiver())
        .filter_map(move |msg| sse_event(msg, account, subscriber));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn sse_event(
    msg: Result<LedgerEvent, BroadcastStreamRecvError>,
    account: Option<AccountId>,
    subscriber: SubscriberId,
) -> Option<Result<SseEvent, Infallible>> {
    match msg {
        Ok(event) if account.is_none_or(|id| event.involves(id)) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(event.event_type()).data(data)))
        }
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(%subscriber, skipped, "slow event stream; oldest events dropped");
            None
        }
    }
}
