//! Account model and ledger rules.
//!
//! This crate contains **pure domain** primitives (no storage, no network).

pub mod account;
pub mod error;
pub mod id;
pub mod idempotency;
pub mod ledger;
pub mod money;

pub use account::{
    Account, DepositOutcome, OperationType, ProcessedOperation, TransactionRecord, TransactionType,
    TransferReceipt,
};
pub use error::{LedgerError, LedgerResult};
pub use id::{AccountId, OperationId};
pub use idempotency::{IdempotencyKey, generate_key, generate_transfer_key};
pub use ledger::{AccountGuard, LedgerAccount};
pub use money::Amount;
