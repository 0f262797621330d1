//! Ledger error model.

use thiserror::Error;

use crate::id::AccountId;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-level error.
///
/// A duplicate idempotent deposit is deliberately *not* represented here: it is
/// the expected outcome under at-least-once delivery and is returned as
/// `DepositOutcome::Duplicate` on the success path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed or out-of-range input, rejected before touching the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced account does not exist.
    #[error("account {0} not found")]
    NotFound(AccountId),

    /// The account balance is lower than the requested debit.
    #[error("insufficient funds on account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: i64,
        requested: i64,
    },

    /// Storage or queue unavailable. Retryable.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(account_id: AccountId) -> Self {
        Self::NotFound(account_id)
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// Whether retrying the same call can succeed without any other change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}
