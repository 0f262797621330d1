//! In-process ledger operations guarded by a per-account mutex.
//!
//! Same contract as the durable store's atomic operations, backed by memory
//! instead of a database row lock. The two mechanisms must never share an
//! account set: a process picks one store at startup.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::account::Account;
use crate::error::{LedgerError, LedgerResult};
use crate::id::AccountId;
use crate::money::{self, Amount};

/// An account value behind its own lock.
#[derive(Debug)]
pub struct LedgerAccount {
    id: AccountId,
    state: Mutex<Account>,
}

impl LedgerAccount {
    pub fn new(account: Account) -> Self {
        Self {
            id: account.id,
            state: Mutex::new(account),
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    /// Acquire the account lock. Poisoning surfaces as an infrastructure error.
    pub fn lock(&self) -> LedgerResult<AccountGuard<'_>> {
        self.state
            .lock()
            .map(AccountGuard)
            .map_err(|_| LedgerError::infrastructure(format!("account {} lock poisoned", self.id)))
    }

    /// Credit `amount` (must be > 0) and return the new balance.
    pub fn add_amount(&self, amount: i64) -> LedgerResult<i64> {
        let amount = Amount::new(amount)?;
        self.lock()?.credit(amount)
    }

    /// Debit `amount` (must be > 0) and return the new balance.
    ///
    /// Fails with `InsufficientFunds` and leaves the balance untouched when the
    /// debit would drive it negative.
    pub fn remove_amount(&self, amount: i64) -> LedgerResult<i64> {
        let amount = Amount::new(amount)?;
        self.lock()?.debit(amount)
    }

    pub fn get_balance(&self) -> LedgerResult<i64> {
        Ok(self.lock()?.account().balance)
    }

    pub fn snapshot(&self) -> LedgerResult<Account> {
        Ok(self.lock()?.account().clone())
    }
}

/// Exclusive access to one account for the lifetime of the guard.
#[derive(Debug)]
pub struct AccountGuard<'a>(MutexGuard<'a, Account>);

impl AccountGuard<'_> {
    pub fn account(&self) -> &Account {
        &self.0
    }

    /// Fails the same way `credit` would, without changing anything.
    pub fn check_credit(&self, amount: Amount) -> LedgerResult<()> {
        money::credit(self.0.balance, amount).map(|_| ())
    }

    pub fn credit(&mut self, amount: Amount) -> LedgerResult<i64> {
        let next = money::credit(self.0.balance, amount)?;
        self.0.balance = next;
        self.0.version += 1;
        debug!(account_id = %self.0.id, amount = amount.get(), balance = next, "credited");
        Ok(next)
    }

    pub fn debit(&mut self, amount: Amount) -> LedgerResult<i64> {
        let next = money::debit(self.0.balance, amount).ok_or(LedgerError::InsufficientFunds {
            account_id: self.0.id,
            balance: self.0.balance,
            requested: amount.get(),
        })?;
        self.0.balance = next;
        self.0.version += 1;
        debug!(account_id = %self.0.id, amount = amount.get(), balance = next, "debited");
        Ok(next)
    }
}

/// Lock two distinct accounts, always in ascending id order.
///
/// The guards are returned in argument order (`first`, `second`) whatever order
/// they were acquired in.
pub fn lock_pair<'a>(
    first: &'a LedgerAccount,
    second: &'a LedgerAccount,
) -> LedgerResult<(AccountGuard<'a>, AccountGuard<'a>)> {
    if first.id() == second.id() {
        return Err(LedgerError::validation("cannot lock the same account twice"));
    }

    if first.id() < second.id() {
        let a = first.lock()?;
        let b = second.lock()?;
        Ok((a, b))
    } else {
        let b = second.lock()?;
        let a = first.lock()?;
        Ok((a, b))
    }
}

/// Move `amount` between two accounts atomically with respect to other callers
/// of this module. Returns `(from, to)` after the move.
pub fn transfer(
    from: &LedgerAccount,
    to: &LedgerAccount,
    amount: Amount,
) -> LedgerResult<(Account, Account)> {
    let (mut src, mut dst) = lock_pair(from, to)?;

    // Both legs must be known to succeed before either is applied.
    dst.check_credit(amount)?;
    src.debit(amount)?;
    dst.credit(amount)?;

    Ok((src.account().clone(), dst.account().clone()))
}
