use axum::extract::State;
use axum::Json;
use huddle_agent::cache::CacheStats;
use huddle_agent::prefetch::PrefetchReport;
use serde_json::{json, Value};
use tracing::info;

use crate::state::AppState;

pub async fn refresh(State(state): State<AppState>) -> Json<PrefetchReport> {
    let registry = state.tools.tools().await;
    Json(state.fetcher.refresh(&registry, &state.cache).await)
}

pub async fn stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

pub async fn clear(State(state): State<AppState>) -> Json<Value> {
    state.cache.clear().await;
    info!(event_name = "server.cache.cleared", "reference cache cleared");
    Json(json!({ "status": "cleared" }))
}
