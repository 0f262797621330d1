use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::app::{dto, services::{self, AppServices}};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "backend": services.backend(),
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub account_id: Option<i64>,
}

/// GET /events
///
/// Server-sent events for every committed ledger change and every deposit
/// that failed for good. `?account_id=` keeps only events touching that account.
pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<StreamQuery>,
) -> axum::response::Response {
    let account = match query.account_id.map(dto::account_id).transpose() {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    services::ledger_sse_stream(&services, account).into_response()
}
