//! Deposit command: the queue message schema shared by producer and consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgerline_core::{
    AccountId, Amount, IdempotencyKey, OperationId, OperationType, generate_key,
};

/// Request to credit an account, delivered at-least-once.
///
/// `operation_id` is a correlation id for tracing only. Deduplication keys off
/// `idempotency_key`, so every redelivery of this message is applied at most once.
///
/// Wire shape (stable across producer/consumer versions):
/// `{"operationId", "idempotencyKey", "accountId", "amount", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositCommand {
    pub operation_id: OperationId,
    pub idempotency_key: IdempotencyKey,
    pub account_id: AccountId,
    pub amount: Amount,
    pub timestamp: DateTime<Utc>,
}

impl DepositCommand {
    /// Build a command whose key is derived from `(deposit, account, amount)`.
    pub fn new(account_id: AccountId, amount: Amount) -> Self {
        Self {
            operation_id: OperationId::new(),
            idempotency_key: generate_key(OperationType::Deposit, account_id, amount),
            account_id,
            amount,
            timestamp: Utc::now(),
        }
    }

    /// Build a command with a caller-chosen key (e.g. from an `Idempotency-Key` header).
    pub fn with_key(account_id: AccountId, amount: Amount, idempotency_key: IdempotencyKey) -> Self {
        Self {
            idempotency_key,
            ..Self::new(account_id, amount)
        }
    }

    /// Partition this command is routed to. All commands for one account share
    /// a partition, so they are consumed in enqueue order.
    pub fn partition(&self, partitions: u32) -> u32 {
        partition_for(self.account_id, partitions)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// Stable account → partition mapping.
pub fn partition_for(account_id: AccountId, partitions: u32) -> u32 {
    let partitions = partitions.max(1) as i64;
    (account_id.get() % partitions) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i64) -> AccountId {
        AccountId::new(raw).unwrap()
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let cmd = DepositCommand::new(id(3), Amount::new(1_000).unwrap());
        let json: serde_json::Value = serde_json::from_str(&cmd.encode().unwrap()).unwrap();
        for field in ["operationId", "idempotencyKey", "accountId", "amount", "timestamp"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(DepositCommand::decode(&cmd.encode().unwrap()).unwrap(), cmd);
    }

    #[test]
    fn redelivered_commands_share_a_key_but_not_an_operation_id() {
        let a = DepositCommand::new(id(3), Amount::new(1_000).unwrap());
        let b = DepositCommand::new(id(3), Amount::new(1_000).unwrap());
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_ne!(a.operation_id, b.operation_id);
    }

    #[test]
    fn decode_rejects_non_positive_amounts_and_ids() {
        let cmd = DepositCommand::new(id(3), Amount::new(10).unwrap());
        let mut json: serde_json::Value = serde_json::to_value(&cmd).unwrap();
        json["amount"] = serde_json::json!(0);
        assert!(serde_json::from_value::<DepositCommand>(json.clone()).is_err());
        json["amount"] = serde_json::json!(10);
        json["accountId"] = serde_json::json!(-1);
        assert!(serde_json::from_value::<DepositCommand>(json).is_err());
    }

    #[test]
    fn same_account_always_maps_to_same_partition() {
        assert_eq!(partition_for(id(17), 8), partition_for(id(17), 8));
        assert!(partition_for(id(17), 8) < 8);
        assert_eq!(partition_for(id(17), 0), 0);
    }
}
