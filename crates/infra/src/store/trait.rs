use std::sync::Arc;

use async_trait::async_trait;

use ledgerline_core::{
    Account, AccountId, Amount, DepositOutcome, IdempotencyKey, LedgerResult, TransactionRecord,
    TransferReceipt,
};

/// Default page size for transaction history.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Upper bound on a single history page.
pub const MAX_HISTORY_LIMIT: u32 = 500;

/// Transactional account storage.
///
/// One implementation is selected at process start and shared by every caller;
/// the in-memory and Postgres variants must never serve the same account set.
///
/// ## Atomicity
///
/// Every mutator runs lock + read + check + write + audit as one unit. A call
/// either commits all of it or changes nothing.
///
/// ## Locking
///
/// - `withdraw` and `deposit` hold an exclusive lock on the account for the
///   duration of the unit.
/// - `transfer` locks both accounts in ascending id order, regardless of the
///   direction of the transfer, before touching either balance.
///
/// ## Errors
///
/// - `Validation`: rejected input (e.g. self-transfer)
/// - `NotFound`: a referenced account does not exist
/// - `InsufficientFunds`: the debit would make a balance negative
/// - `Infrastructure`: storage unavailable; retryable
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open an account with zero balance. `owner` is validated by the caller.
    async fn create_account(&self, owner: &str) -> LedgerResult<AccountId>;

    async fn get_account(&self, id: AccountId) -> LedgerResult<Account>;

    async fn withdraw(&self, id: AccountId, amount: Amount) -> LedgerResult<Account>;

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferReceipt>;

    /// Credit `amount` at most once per `key`.
    ///
    /// A key that is already recorded yields `DepositOutcome::Duplicate` with the
    /// account state reconstructed from the stored result; nothing is re-applied.
    async fn deposit(
        &self,
        id: AccountId,
        amount: Amount,
        key: &IdempotencyKey,
    ) -> LedgerResult<DepositOutcome>;

    /// Audit trail for one account, newest first.
    async fn list_transactions(
        &self,
        id: AccountId,
        limit: u32,
    ) -> LedgerResult<Vec<TransactionRecord>>;

    /// Drop all accounts, audit rows and dedup records. Test/dev only.
    async fn reset(&self) -> LedgerResult<()>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn create_account(&self, owner: &str) -> LedgerResult<AccountId> {
        (**self).create_account(owner).await
    }

    async fn get_account(&self, id: AccountId) -> LedgerResult<Account> {
        (**self).get_account(id).await
    }

    async fn withdraw(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        (**self).withdraw(id, amount).await
    }

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferReceipt> {
        (**self).transfer(from, to, amount).await
    }

    async fn deposit(
        &self,
        id: AccountId,
        amount: Amount,
        key: &IdempotencyKey,
    ) -> LedgerResult<DepositOutcome> {
        (**self).deposit(id, amount, key).await
    }

    async fn list_transactions(
        &self,
        id: AccountId,
        limit: u32,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        (**self).list_transactions(id, limit).await
    }

    async fn reset(&self) -> LedgerResult<()> {
        (**self).reset().await
    }
}

/// Clamp a requested history page size into `1..=MAX_HISTORY_LIMIT`.
pub fn clamp_history_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_HISTORY_LIMIT)
}
