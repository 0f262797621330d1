use axum::{
    Router,
    routing::{get, post},
};

pub mod accounts;
pub mod admin;
pub mod system;
pub mod transfers;

/// Router for every ledger endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/events", get(system::stream))
        .route("/transfers", post(transfers::create_transfer))
        .nest("/accounts", accounts::router())
        .nest("/admin", admin::router())
}
