//! Event publishing/subscription abstraction.
//!
//! Live fan-out only: the bus distributes notifications of operations that have
//! already committed. It is not a source of truth and does not persist anything.
//!
//! ## Delivery
//!
//! - Every subscriber gets its own copy of every event published after it subscribed.
//! - Each subscriber has a bounded buffer. When a subscriber falls behind, its
//!   **oldest** undelivered events are overwritten; the publisher never waits.
//! - A lagging subscriber learns how many events it missed (logged at `warn`).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

/// Identifier of a live subscription.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl core::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Why a receive call returned without a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecvError {
    /// The subscription was removed or the bus shut down.
    Closed,
    /// Nothing arrived within the timeout.
    Timeout,
}

/// A subscription to the event stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut sub = bus.subscribe();
/// while let Some(event) = sub.recv().await {
///     forward(event);
/// }
/// // bus closed or subscription removed
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    id: SubscriberId,
    receiver: broadcast::Receiver<M>,
    missed: u64,
}

impl<M: Clone> Subscription<M> {
    pub fn new(id: SubscriberId, receiver: broadcast::Receiver<M>) -> Self {
        Self {
            id,
            receiver,
            missed: 0,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Events overwritten before this subscriber could read them.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Wait for the next event. `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for up to `timeout` for the next event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<M, RecvError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(RecvError::Closed),
            Err(_) => Err(RecvError::Timeout),
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(_) => return None,
            }
        }
    }

    /// Give up the wrapper, e.g. to adapt the receiver into a stream.
    pub fn into_receiver(self) -> broadcast::Receiver<M> {
        self.receiver
    }

    fn record_lag(&mut self, skipped: u64) {
        self.missed += skipped;
        warn!(subscriber = %self.id, skipped, "slow subscriber; oldest events dropped");
    }
}

/// Publish/subscribe hub for ledger notifications.
///
/// `publish()` is non-blocking with respect to subscribers: a slow reader can
/// lose its oldest buffered events but can never stall the publisher.
///
/// The trait requires `Send + Sync`; implementations are shared process-wide.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;

    /// Deregister a subscription. Its receiver drains what is buffered, then closes.
    fn unsubscribe(&self, id: SubscriberId) -> Result<(), Self::Error>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn unsubscribe(&self, id: SubscriberId) -> Result<(), Self::Error> {
        (**self).unsubscribe(id)
    }
}
