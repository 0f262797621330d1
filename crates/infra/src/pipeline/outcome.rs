//! What the consumer does with a command after one processing attempt.
//!
//! | Attempt result | State | Ack | Failure event | Dead letter |
//! |---|---|---|---|---|
//! | `Ok(Applied)` | `Completed` | yes | no | no |
//! | `Ok(Duplicate)` | `Duplicate` | yes | no | no |
//! | `Err(NotFound)` | `PermanentlyFailed` | yes | yes | no |
//! | `Err(Validation)` | `PermanentlyFailed` | yes | yes | no |
//! | `Err(InsufficientFunds)` | `PermanentlyFailed` | yes | yes | no |
//! | `Err(Infrastructure)` | `Retry` | **no** | no | no |
//! | payload does not decode | `Poisoned` | yes | no | yes |
//!
//! `Retry` leaves the command in the queue; it is delivered again.

use serde::Serialize;

use ledgerline_core::{DepositOutcome, LedgerError, LedgerResult};

/// Terminal (or retry) state of one deposit command attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Completed,
    Duplicate,
    PermanentlyFailed,
    Poisoned,
    Retry,
}

impl CommandState {
    pub fn from_result(result: &LedgerResult<DepositOutcome>) -> Self {
        match result {
            Ok(DepositOutcome::Applied(_)) => CommandState::Completed,
            Ok(DepositOutcome::Duplicate(_)) => CommandState::Duplicate,
            Err(LedgerError::Infrastructure(_)) => CommandState::Retry,
            Err(
                LedgerError::NotFound(_)
                | LedgerError::Validation(_)
                | LedgerError::InsufficientFunds { .. },
            ) => CommandState::PermanentlyFailed,
        }
    }

    /// Commit the read position: the command must not be delivered again.
    pub fn acknowledges(self) -> bool {
        !matches!(self, CommandState::Retry)
    }

    /// Emit a `TransactionFailed` notification instead of a completion event.
    pub fn emits_failure(self) -> bool {
        matches!(self, CommandState::PermanentlyFailed)
    }

    pub fn dead_letters(self) -> bool {
        matches!(self, CommandState::Poisoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Completed => "completed",
            CommandState::Duplicate => "duplicate",
            CommandState::PermanentlyFailed => "permanently_failed",
            CommandState::Poisoned => "poisoned",
            CommandState::Retry => "retry",
        }
    }
}

impl core::fmt::Display for CommandState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ledgerline_core::{Account, AccountId};

    fn account() -> Account {
        Account::open(AccountId::new(1).unwrap(), "alice", Utc::now())
    }

    fn id() -> AccountId {
        AccountId::new(1).unwrap()
    }

    #[test]
    fn applied_completes_and_acks() {
        let s = CommandState::from_result(&Ok(DepositOutcome::Applied(account())));
        assert_eq!(s, CommandState::Completed);
        assert!(s.acknowledges());
        assert!(!s.emits_failure());
        assert!(!s.dead_letters());
    }

    #[test]
    fn duplicate_is_success_and_acks() {
        let s = CommandState::from_result(&Ok(DepositOutcome::Duplicate(account())));
        assert_eq!(s, CommandState::Duplicate);
        assert!(s.acknowledges());
        assert!(!s.emits_failure());
        assert!(!s.dead_letters());
    }

    #[test]
    fn missing_account_is_permanent_and_reported() {
        let s = CommandState::from_result(&Err(LedgerError::NotFound(id())));
        assert_eq!(s, CommandState::PermanentlyFailed);
        assert!(s.acknowledges());
        assert!(s.emits_failure());
        assert!(!s.dead_letters());
    }

    #[test]
    fn validation_and_funds_errors_are_permanent() {
        for err in [
            LedgerError::validation("balance overflow"),
            LedgerError::InsufficientFunds {
                account_id: id(),
                balance: 0,
                requested: 1,
            },
        ] {
            let s = CommandState::from_result(&Err(err));
            assert_eq!(s, CommandState::PermanentlyFailed);
            assert!(s.acknowledges());
            assert!(s.emits_failure());
        }
    }

    #[test]
    fn infrastructure_failure_is_retried_without_ack() {
        let s = CommandState::from_result(&Err(LedgerError::infrastructure("db down")));
        assert_eq!(s, CommandState::Retry);
        assert!(!s.acknowledges());
        assert!(!s.emits_failure());
        assert!(!s.dead_letters());
    }

    #[test]
    fn poisoned_is_dead_lettered_and_acked_silently() {
        let s = CommandState::Poisoned;
        assert!(s.acknowledges());
        assert!(s.dead_letters());
        assert!(!s.emits_failure());
    }

    #[test]
    fn retry_is_the_only_non_acknowledging_state() {
        let all = [
            CommandState::Completed,
            CommandState::Duplicate,
            CommandState::PermanentlyFailed,
            CommandState::Poisoned,
            CommandState::Retry,
        ];
        let not_acked: Vec<_> = all.into_iter().filter(|s| !s.acknowledges()).collect();
        assert_eq!(not_acked, vec![CommandState::Retry]);
        assert_eq!(CommandState::PermanentlyFailed.to_string(), "permanently_failed");
    }
}
