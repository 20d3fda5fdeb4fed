//! Observability surface: a liveness probe and a JSON snapshot of the
//! pipeline counters.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use crate::stats::{Stats, StatsSnapshot};

#[derive(Clone)]
pub struct WebState {
    pub stats: Arc<Stats>,
}

pub async fn serve(state: WebState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(state);
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<WebState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}
