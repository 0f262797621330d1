//! Ledger events and the deposit command schema.
//!
//! - [`event`]: notifications published after an operation commits
//! - [`command`]: the asynchronous deposit message carried by the command queue
//! - [`bus`] / [`broker`]: live fan-out to subscribers

pub mod broker;
pub mod bus;
pub mod command;
pub mod event;

pub use broker::{BrokerError, DEFAULT_SUBSCRIBER_BUFFER, EventBroker};
pub use bus::{EventBus, RecvError, SubscriberId, Subscription};
pub use command::{DepositCommand, partition_for};
pub use event::{Event, LedgerEvent};
