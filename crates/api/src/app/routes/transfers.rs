use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::{dto, errors, services::AppServices};

pub async fn create_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::TransferRequest>, JsonRejection>,
) -> axum::response::Response {
    let body = match dto::body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let parsed = dto::account_id(body.from_id).and_then(|from| {
        dto::account_id(body.to_id).and_then(|to| dto::amount(body.amount).map(|a| (from, to, a)))
    });
    let (from, to, amount) = match parsed {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if from == to {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "cannot transfer to the same account",
        );
    }

    match services.transfer(from, to, amount).await {
        Ok(receipt) => (StatusCode::OK, Json(dto::receipt_to_json(&receipt))).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}
