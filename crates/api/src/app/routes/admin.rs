//! Operational endpoints. `/admin/reset` wipes every account; dev/test only.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/pipeline", get(pipeline_stats))
        .route("/reset", post(reset))
}

pub async fn pipeline_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let stats = services.pipeline_stats();
    let subscribers = services.subscriber_count().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "backend": services.backend(),
            "producer": stats.producer,
            "consumer": stats.consumer,
            "event_subscribers": subscribers,
        })),
    )
        .into_response()
}

pub async fn reset(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.reset().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}
