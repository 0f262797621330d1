use std::sync::Arc;

use anyhow::Context;

use ledgerline_api::app::{build_app, services::build_services};
use ledgerline_infra::LedgerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ledgerline_observability::init();

    let config = LedgerConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        build_services(&config)
            .await
            .context("failed to start ledger services")?,
    );

    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // In-flight deposits finish; anything unacknowledged stays queued.
    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "ctrl-c handler failed; shutting down");
    }
    tracing::info!("shutdown requested");
}
