//! Single-owner event broker.
//!
//! One task owns the subscriber set. `subscribe`, `unsubscribe` and `publish`
//! only enqueue a request to that task; nothing else ever touches the set, so
//! there is no shared mutable state between callers.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, SubscriberId, Subscription};

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("event broker is closed")]
    Closed,
}

enum BrokerCommand<M> {
    Subscribe {
        id: SubscriberId,
        sender: broadcast::Sender<M>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    Publish(M),
    SubscriberCount(oneshot::Sender<usize>),
    Shutdown,
}

/// Handle to the broker task. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct EventBroker<M> {
    inbox: mpsc::UnboundedSender<BrokerCommand<M>>,
    next_id: AtomicU64,
    buffer: usize,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<M> EventBroker<M>
where
    M: Clone + Send + 'static,
{
    /// Spawn the broker task on the current tokio runtime.
    ///
    /// `buffer` is the per-subscriber capacity; past it the oldest events of
    /// that subscriber are overwritten.
    pub fn spawn(buffer: usize) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx));

        Self {
            inbox,
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            task: Mutex::new(Some(task)),
        }
    }

    /// Number of registered subscribers, as seen by the broker task.
    ///
    /// Because requests are processed in order, this also acts as a barrier:
    /// every request sent before this call has been handled when it returns.
    pub async fn subscriber_count(&self) -> Result<usize, BrokerError> {
        let (reply, answer) = oneshot::channel();
        self.send(BrokerCommand::SubscriberCount(reply))?;
        answer.await.map_err(|_| BrokerError::Closed)
    }

    /// Stop the broker task. All subscriptions close after draining.
    pub async fn shutdown(&self) {
        let _ = self.inbox.send(BrokerCommand::Shutdown);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn send(&self, command: BrokerCommand<M>) -> Result<(), BrokerError> {
        self.inbox.send(command).map_err(|_| BrokerError::Closed)
    }
}

impl<M> EventBus<M> for EventBroker<M>
where
    M: Clone + Send + 'static,
{
    type Error = BrokerError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        self.send(BrokerCommand::Publish(message))
    }

    fn subscribe(&self) -> Subscription<M> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = broadcast::channel(self.buffer);

        // If the broker is gone the sender is dropped here and the
        // subscription reports closed on first receive.
        if self.send(BrokerCommand::Subscribe { id, sender }).is_err() {
            warn!(subscriber = %id, "subscribe on closed broker");
        }

        Subscription::new(id, receiver)
    }

    fn unsubscribe(&self, id: SubscriberId) -> Result<(), Self::Error> {
        self.send(BrokerCommand::Unsubscribe { id })
    }
}

async fn run<M: Clone>(mut inbox: mpsc::UnboundedReceiver<BrokerCommand<M>>) {
    let mut subscribers: BTreeMap<SubscriberId, broadcast::Sender<M>> = BTreeMap::new();

    while let Some(command) = inbox.recv().await {
        match command {
            BrokerCommand::Subscribe { id, sender } => {
                subscribers.insert(id, sender);
                debug!(subscriber = %id, total = subscribers.len(), "subscriber registered");
            }
            BrokerCommand::Unsubscribe { id } => {
                // Dropping the sender closes the subscriber's receiver.
                if subscribers.remove(&id).is_some() {
                    debug!(subscriber = %id, total = subscribers.len(), "subscriber removed");
                }
            }
            BrokerCommand::Publish(message) => {
                // Drop subscribers whose receiver is gone while publishing.
                subscribers.retain(|id, sender| {
                    if sender.receiver_count() == 0 {
                        debug!(subscriber = %id, "subscriber dropped its receiver");
                        return false;
                    }
                    let _ = sender.send(message.clone());
                    true
                });
            }
            BrokerCommand::SubscriberCount(reply) => {
                let _ = reply.send(subscribers.len());
            }
            BrokerCommand::Shutdown => break,
        }
    }

    info!(remaining = subscribers.len(), "event broker stopped");
}
