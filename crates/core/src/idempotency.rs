//! Deterministic idempotency keys.
//!
//! A key is the SHA-256 (lowercase hex) of the operation's semantic inputs.
//! Identical inputs always hash to the same key, so a retried request or a
//! redelivered queue message lands on the same dedup record.
//!
//! ## Known limitation
//!
//! The key covers only `(operation, account, amount)`. Two independent, legitimate
//! deposits of the same amount to the same account are indistinguishable from a
//! redelivery and collapse into one. Callers that need both applied must supply
//! their own distinct key (see `IdempotencyKey::from_caller_token`).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::account::OperationType;
use crate::error::{LedgerError, LedgerResult};
use crate::id::AccountId;
use crate::money::Amount;

/// Length of a key in hex characters (SHA-256).
pub const KEY_LEN: usize = 64;

/// Fixed-length dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate a key read back from storage or from the wire.
    pub fn parse(raw: impl Into<String>) -> LedgerResult<Self> {
        let raw = raw.into();
        let well_formed = raw.len() == KEY_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(LedgerError::validation(format!(
                "idempotency key must be {KEY_LEN} lowercase hex characters"
            )));
        }
        Ok(Self(raw))
    }

    /// Derive a key from an opaque caller-supplied token (e.g. an
    /// `Idempotency-Key` request header), so distinct tokens never collide.
    ///
    /// The token is scoped to the target account: the same token sent to two
    /// accounts names two operations.
    pub fn from_caller_token(account_id: AccountId, token: &str) -> Self {
        Self(digest(&["token", &account_id.to_string(), token]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}

/// Key for a single-account operation.
pub fn generate_key(operation: OperationType, account_id: AccountId, amount: Amount) -> IdempotencyKey {
    IdempotencyKey(digest(&[
        operation.as_str(),
        &account_id.to_string(),
        &amount.to_string(),
    ]))
}

/// Key for a transfer between two accounts. Direction matters.
pub fn generate_transfer_key(from: AccountId, to: AccountId, amount: Amount) -> IdempotencyKey {
    IdempotencyKey(digest(&[
        OperationType::Transfer.as_str(),
        &from.to_string(),
        &to.to_string(),
        &amount.to_string(),
    ]))
}

// Fields are joined with a separator that cannot appear in any of them, so
// ("1", "23") and ("12", "3") never hash the same input.
fn digest(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(raw: i64) -> AccountId {
        AccountId::new(raw).unwrap()
    }

    fn amount(raw: i64) -> Amount {
        Amount::new(raw).unwrap()
    }

    #[test]
    fn key_is_fixed_length_hex() {
        let key = generate_key(OperationType::Deposit, id(1), amount(1000));
        assert_eq!(key.as_str().len(), KEY_LEN);
        assert!(IdempotencyKey::parse(key.as_str()).is_ok());
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = generate_key(OperationType::Deposit, id(1), amount(23));
        let b = generate_key(OperationType::Deposit, id(12), amount(3));
        assert_ne!(a, b);
    }

    #[test]
    fn transfer_key_depends_on_direction() {
        let ab = generate_transfer_key(id(1), id(2), amount(50));
        let ba = generate_transfer_key(id(2), id(1), amount(50));
        assert_ne!(ab, ba);
    }

    #[test]
    fn operation_type_is_part_of_the_key() {
        let deposit = generate_key(OperationType::Deposit, id(5), amount(10));
        let withdraw = generate_key(OperationType::Withdraw, id(5), amount(10));
        assert_ne!(deposit, withdraw);
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(IdempotencyKey::parse("abc").is_err());
        assert!(IdempotencyKey::parse("G".repeat(KEY_LEN)).is_err());
        assert!(IdempotencyKey::parse("A".repeat(KEY_LEN)).is_err());
        assert!(IdempotencyKey::parse("a".repeat(KEY_LEN)).is_ok());
    }

    #[test]
    fn caller_tokens_produce_distinct_valid_keys() {
        let a = IdempotencyKey::from_caller_token(id(1), "req-1");
        let b = IdempotencyKey::from_caller_token(id(1), "req-2");
        assert_ne!(a, b);
        assert!(IdempotencyKey::parse(a.as_str()).is_ok());
    }

    #[test]
    fn caller_token_is_scoped_to_the_account() {
        let first = IdempotencyKey::from_caller_token(id(1), "req-1");
        let second = IdempotencyKey::from_caller_token(id(2), "req-1");
        assert_ne!(first, second);
        assert_eq!(first, IdempotencyKey::from_caller_token(id(1), "req-1"));
    }

    proptest! {
        #[test]
        fn same_inputs_same_key(account in 1i64..1_000_000, minor in 1i64..1_000_000_000) {
            let a = generate_key(OperationType::Deposit, id(account), amount(minor));
            let b = generate_key(OperationType::Deposit, id(account), amount(minor));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn different_amounts_different_keys(account in 1i64..1_000_000, x in 1i64..1_000_000, y in 1i64..1_000_000) {
            prop_assume!(x != y);
            let a = generate_key(OperationType::Deposit, id(account), amount(x));
            let b = generate_key(OperationType::Deposit, id(account), amount(y));
            prop_assert_ne!(a, b);
        }
    }
}
