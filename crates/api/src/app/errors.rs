use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use ledgerline_core::LedgerError;
use ledgerline_infra::EnqueueError;

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    match err {
        LedgerError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        LedgerError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("account {id} not found"),
        ),
        e @ LedgerError::InsufficientFunds { .. } => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "insufficient_funds",
            e.to_string(),
        ),
        LedgerError::Infrastructure(msg) => {
            tracing::error!(error = %msg, "infrastructure failure");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
        }
    }
}

pub fn enqueue_error_to_response(err: EnqueueError) -> axum::response::Response {
    match err {
        EnqueueError::Dropped { .. } => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "deposit_dropped",
            "deposit queue is full; retry later",
        ),
        EnqueueError::Closed => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "deposits are no longer accepted",
        ),
        EnqueueError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
