use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgerline_core::{Account, AccountId, OperationId, TransferReceipt};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "ledger.deposit").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Notification of a completed (or terminally failed) ledger operation.
///
/// Wire shape: `{"type": "...", "accountId" | "fromId"/"toId", "amount",
/// "balance" | "fromBalance"/"toBalance", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LedgerEvent {
    Deposit {
        account_id: AccountId,
        amount: i64,
        balance: i64,
        timestamp: DateTime<Utc>,
    },
    Withdraw {
        account_id: AccountId,
        amount: i64,
        balance: i64,
        timestamp: DateTime<Utc>,
    },
    Transfer {
        from_id: AccountId,
        to_id: AccountId,
        amount: i64,
        from_balance: i64,
        to_balance: i64,
        timestamp: DateTime<Utc>,
    },
    /// An asynchronous deposit that can never succeed (e.g. unknown account).
    TransactionFailed {
        account_id: AccountId,
        amount: i64,
        operation_id: OperationId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl LedgerEvent {
    pub fn deposited(account: &Account, amount: i64) -> Self {
        LedgerEvent::Deposit {
            account_id: account.id,
            amount,
            balance: account.balance,
            timestamp: Utc::now(),
        }
    }

    pub fn withdrawn(account: &Account, amount: i64) -> Self {
        LedgerEvent::Withdraw {
            account_id: account.id,
            amount,
            balance: account.balance,
            timestamp: Utc::now(),
        }
    }

    pub fn transferred(receipt: &TransferReceipt, amount: i64) -> Self {
        LedgerEvent::Transfer {
            from_id: receipt.from.id,
            to_id: receipt.to.id,
            amount,
            from_balance: receipt.from.balance,
            to_balance: receipt.to.balance,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        account_id: AccountId,
        amount: i64,
        operation_id: OperationId,
        reason: impl Into<String>,
    ) -> Self {
        LedgerEvent::TransactionFailed {
            account_id,
            amount,
            operation_id,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Whether the event concerns `account_id` (either side of a transfer).
    pub fn involves(&self, account_id: AccountId) -> bool {
        match self {
            LedgerEvent::Deposit { account_id: id, .. }
            | LedgerEvent::Withdraw { account_id: id, .. }
            | LedgerEvent::TransactionFailed { account_id: id, .. } => *id == account_id,
            LedgerEvent::Transfer { from_id, to_id, .. } => {
                *from_id == account_id || *to_id == account_id
            }
        }
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::Deposit { .. } => "ledger.deposit",
            LedgerEvent::Withdraw { .. } => "ledger.withdraw",
            LedgerEvent::Transfer { .. } => "ledger.transfer",
            LedgerEvent::TransactionFailed { .. } => "ledger.transaction_failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::Deposit { timestamp, .. }
            | LedgerEvent::Withdraw { timestamp, .. }
            | LedgerEvent::Transfer { timestamp, .. }
            | LedgerEvent::TransactionFailed { timestamp, .. } => *timestamp,
        }
    }
}
