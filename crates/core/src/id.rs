//! Strongly-typed identifiers used across the ledger.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

/// Identifier of an account.
///
/// Assigned monotonically by the store on creation; always positive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct AccountId(i64);

impl AccountId {
    /// Wrap a raw identifier, rejecting zero and negative values.
    pub fn new(raw: i64) -> Result<Self, LedgerError> {
        if raw <= 0 {
            return Err(LedgerError::validation(format!(
                "account id must be positive, got {raw}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// Return `(low, high)` so that multi-account locks are always taken in
    /// ascending id order, regardless of the direction of the operation.
    pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
        if a <= b { (a, b) } else { (b, a) }
    }
}

impl core::fmt::Display for AccountId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for AccountId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .parse::<i64>()
            .map_err(|e| LedgerError::validation(format!("AccountId: {e}")))?;
        Self::new(raw)
    }
}

impl TryFrom<i64> for AccountId {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountId> for i64 {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

/// Correlation identifier of an asynchronous operation.
///
/// Used for tracing a command through the pipeline; never used for dedup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for OperationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for OperationId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| LedgerError::validation(format!("OperationId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_rejects_non_positive() {
        assert!(AccountId::new(0).is_err());
        assert!(AccountId::new(-7).is_err());
        assert_eq!(AccountId::new(42).unwrap().get(), 42);
    }

    #[test]
    fn lock_order_is_direction_independent() {
        let a = AccountId::new(3).unwrap();
        let b = AccountId::new(9).unwrap();
        assert_eq!(AccountId::lock_order(a, b), (a, b));
        assert_eq!(AccountId::lock_order(b, a), (a, b));
    }

    #[test]
    fn account_id_parses_from_path_segment() {
        assert_eq!("15".parse::<AccountId>().unwrap().get(), 15);
        assert!("abc".parse::<AccountId>().is_err());
        assert!("0".parse::<AccountId>().is_err());
    }
}
