use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::{dto, errors, services::AppServices};

/// Optional caller-chosen deduplication token for deposits.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_account))
        .route("/:id", get(get_account))
        .route("/:id/transactions", get(list_transactions))
        .route("/:id/withdraw", post(withdraw))
        .route("/:id/deposits", post(request_deposit))
}

pub async fn create_account(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::CreateAccountRequest>, JsonRejection>,
) -> axum::response::Response {
    let owner = match dto::body(payload).and_then(|b| dto::owner(&b.owner)) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.create_account(&owner).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "id": id.get(), "owner": owner })),
        )
            .into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn get_account(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
) -> axum::response::Response {
    let id = match dto::account_id(id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.get_account(id).await {
        Ok(account) => (StatusCode::OK, Json(dto::account_to_json(&account))).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn list_transactions(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
    Query(query): Query<dto::HistoryQuery>,
) -> axum::response::Response {
    let id = match dto::account_id(id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // History of a missing account is a 404, not an empty list.
    if let Err(e) = services.get_account(id).await {
        return errors::ledger_error_to_response(e);
    }

    match services.list_transactions(id, query.limit).await {
        Ok(records) => {
            let items = records.iter().map(dto::transaction_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn withdraw(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
    payload: Result<Json<dto::AmountRequest>, JsonRejection>,
) -> axum::response::Response {
    let (id, amount) = match dto::account_id(id)
        .and_then(|id| dto::body(payload).map(|b| (id, b)))
        .and_then(|(id, b)| dto::amount(b.amount).map(|a| (id, a)))
    {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.withdraw(id, amount).await {
        Ok(account) => (StatusCode::OK, Json(dto::account_to_json(&account))).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

/// POST /accounts/:id/deposits
///
/// Accepted deposits are applied asynchronously; the outcome shows up on
/// `/events` and in the account history. The account is not checked here: a
/// deposit to a missing account ends as a `transaction_failed` event.
pub async fn request_deposit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<dto::AmountRequest>, JsonRejection>,
) -> axum::response::Response {
    let (id, amount) = match dto::account_id(id)
        .and_then(|id| dto::body(payload).map(|b| (id, b)))
        .and_then(|(id, b)| dto::amount(b.amount).map(|a| (id, a)))
    {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let token = match headers.get(IDEMPOTENCY_HEADER).map(|v| v.to_str()) {
        None => None,
        Some(Ok(t)) if !t.trim().is_empty() => Some(t.trim()),
        Some(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "idempotency-key header must be non-empty visible ASCII",
            );
        }
    };

    match services.request_deposit(id, amount, token).await {
        Ok(command) => (
            StatusCode::ACCEPTED,
            Json(dto::deposit_accepted_to_json(&command)),
        )
            .into_response(),
        Err(e) => errors::enqueue_error_to_response(e),
    }
}
