//! Account model, audit trail records, and the idempotency ledger row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::id::AccountId;
use crate::idempotency::IdempotencyKey;
use crate::money::Amount;

/// An account and its balance in minor units.
///
/// Invariant: `balance >= 0`. Every mutator checks this before commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    /// Optimistic version counter; bumped on every balance change.
    pub version: i64,
}

impl Account {
    /// A freshly opened account with zero balance.
    pub fn open(id: AccountId, owner: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner: owner.into(),
            balance: 0,
            created_at,
            version: 0,
        }
    }
}

/// Kind of an audit trail entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdraw,
    TransferIn,
    TransferOut,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdraw => "withdraw",
            TransactionType::TransferIn => "transfer_in",
            TransactionType::TransferOut => "transfer_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(TransactionType::Deposit),
            "withdraw" => Some(TransactionType::Withdraw),
            "transfer_in" => Some(TransactionType::TransferIn),
            "transfer_out" => Some(TransactionType::TransferOut),
            _ => None,
        }
    }
}

/// Append-only audit record of one balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub account_id: AccountId,
    pub kind: TransactionType,
    pub amount: i64,
    pub balance_after: i64,
    /// Links the two legs of a transfer; holds the idempotency key for deposits.
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Operation kinds that go through the idempotency ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Deposit,
    Withdraw,
    Transfer,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Deposit => "deposit",
            OperationType::Withdraw => "withdraw",
            OperationType::Transfer => "transfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(OperationType::Deposit),
            "withdraw" => Some(OperationType::Withdraw),
            "transfer" => Some(OperationType::Transfer),
            _ => None,
        }
    }
}

/// One applied operation, recorded in the same transaction as its balance change.
///
/// Presence of `idempotency_key` is the only source of truth for "already applied".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedOperation {
    pub idempotency_key: IdempotencyKey,
    pub operation: OperationType,
    pub account_id: AccountId,
    pub amount: i64,
    pub balance_after: i64,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedOperation {
    /// Rebuild the account state a duplicate call should observe: the stored
    /// result of the first application, layered over the account's identity.
    pub fn replay_onto(&self, account: &Account) -> Account {
        Account {
            balance: self.balance_after,
            ..account.clone()
        }
    }

    /// A recorded key may only be replayed for the operation it was recorded
    /// for. Anything else is a caller reusing a key, not a redelivery.
    pub fn check_matches(&self, account_id: AccountId, amount: Amount) -> LedgerResult<()> {
        if self.account_id != account_id || self.amount != amount.get() {
            return Err(LedgerError::validation(
                "idempotency key reused for a different operation",
            ));
        }
        Ok(())
    }
}

/// Outcome of an idempotent deposit.
///
/// `Duplicate` is a success: the key was already recorded and nothing was
/// re-applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositOutcome {
    Applied(Account),
    Duplicate(Account),
}

impl DepositOutcome {
    pub fn account(&self) -> &Account {
        match self {
            DepositOutcome::Applied(a) | DepositOutcome::Duplicate(a) => a,
        }
    }

    pub fn into_account(self) -> Account {
        match self {
            DepositOutcome::Applied(a) | DepositOutcome::Duplicate(a) => a,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, DepositOutcome::Duplicate(_))
    }
}

/// Both sides of a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub from: Account,
    pub to: Account,
    /// Shared reference id of the two audit legs.
    pub reference_id: String,
}
