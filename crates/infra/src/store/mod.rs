//! Account storage.
//!
//! [`LedgerStore`] is the one interface every caller mutates balances through.
//! Exactly one backend is chosen at startup:
//!
//! - [`InMemoryLedgerStore`]: per-account mutexes (tests/dev)
//! - [`PostgresLedgerStore`]: row locks inside database transactions
//!
//! [`PublishingLedgerStore`] wraps either and fans committed changes out to the
//! event broker.

pub mod in_memory;
pub mod postgres;
pub mod publishing;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use publishing::PublishingLedgerStore;
pub use r#trait::{DEFAULT_HISTORY_LIMIT, LedgerStore, MAX_HISTORY_LIMIT, clamp_history_limit};
