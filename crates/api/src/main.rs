use std::env;
use std::time::Duration;

use anyhow::Result;
use haven_api::{build_router, state_from_env};
use haven_observability::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("haven_api");

    let bind = env::var("HAVEN_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let state = state_from_env().await?;

    let limiter = state.limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            limiter.prune();
        }
    });

    let backend = state.store.backend_name();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, backend, "haven api started");

    axum::serve(listener, app).await?;
    Ok(())
}
