//! Integer money in minor currency units (e.g. cents). No floats anywhere.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// A strictly positive amount to move, in minor units.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(minor_units: i64) -> LedgerResult<Self> {
        if minor_units <= 0 {
            return Err(LedgerError::validation(format!(
                "amount must be a positive integer, got {minor_units}"
            )));
        }
        Ok(Self(minor_units))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Apply a credit to a balance, failing on overflow instead of wrapping.
pub fn credit(balance: i64, amount: Amount) -> LedgerResult<i64> {
    balance
        .checked_add(amount.get())
        .ok_or_else(|| LedgerError::validation("balance overflow"))
}

/// Apply a debit to a balance. Returns `None` when the result would be negative.
pub fn debit(balance: i64, amount: Amount) -> Option<i64> {
    balance.checked_sub(amount.get()).filter(|b| *b >= 0)
}
