use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use ledgerline_core::{Account, AccountId, Amount, TransactionRecord, TransferReceipt};
use ledgerline_events::DepositCommand;

use crate::app::errors;

/// Longest accepted owner name, in characters.
pub const MAX_OWNER_LEN: usize = 255;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub owner: String,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_id: i64,
    pub to_id: i64,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

// -------------------------
// Request validation
// -------------------------

/// Unwrap a JSON body, turning extractor rejections into our error shape.
pub fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, axum::response::Response> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()))
}

pub fn account_id(raw: i64) -> Result<AccountId, axum::response::Response> {
    AccountId::new(raw).map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "account id must be a positive integer",
        )
    })
}

pub fn amount(raw: i64) -> Result<Amount, axum::response::Response> {
    Amount::new(raw).map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "amount must be a positive integer in minor units",
        )
    })
}

pub fn owner(raw: &str) -> Result<String, axum::response::Response> {
    let owner = raw.trim();
    if owner.is_empty() || owner.chars().count() > MAX_OWNER_LEN {
        return Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("owner must be 1..={MAX_OWNER_LEN} characters"),
        ));
    }
    Ok(owner.to_string())
}

// -------------------------
// Response mapping
// -------------------------

pub fn account_to_json(account: &Account) -> Value {
    json!({
        "id": account.id.get(),
        "owner": account.owner,
        "balance": account.balance,
        "created_at": account.created_at.to_rfc3339(),
        "version": account.version,
    })
}

pub fn transaction_to_json(record: &TransactionRecord) -> Value {
    json!({
        "id": record.id,
        "account_id": record.account_id.get(),
        "type": record.kind.as_str(),
        "amount": record.amount,
        "balance_after": record.balance_after,
        "reference_id": record.reference_id,
        "created_at": record.created_at.to_rfc3339(),
    })
}

pub fn receipt_to_json(receipt: &TransferReceipt) -> Value {
    json!({
        "reference_id": receipt.reference_id,
        "from": account_to_json(&receipt.from),
        "to": account_to_json(&receipt.to),
    })
}

pub fn deposit_accepted_to_json(command: &DepositCommand) -> Value {
    json!({
        "operation_id": command.operation_id.to_string(),
        "idempotency_key": command.idempotency_key.as_str(),
        "account_id": command.account_id.get(),
        "amount": command.amount.get(),
        "status": "accepted",
    })
}
