use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use huddle_agent::cache::CacheStats;
use huddle_mcp::ServerStatus;
use serde::Serialize;
use serde_json::Value;

use crate::state::AppState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolsCheck {
    pub status: &'static str,
    pub count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub tools: ToolsCheck,
    pub servers: Vec<ServerStatus>,
    pub cache: CacheStats,
    pub checked_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolListing {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolsResponse {
    pub count: usize,
    pub tools: Vec<ToolListing>,
}

/// Ready only once at least one tool has been discovered.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let count = state.tools.tools().await.len();
    let ready = count > 0;

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        tools: ToolsCheck { status: if ready { "ready" } else { "degraded" }, count },
        servers: state.tools.servers().await,
        cache: state.cache.stats().await,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

pub async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    let tools = state
        .tools
        .tools()
        .await
        .schemas()
        .into_iter()
        .map(|schema| ToolListing {
            name: schema.name,
            description: schema.description,
            input_schema: schema.parameters,
        })
        .collect::<Vec<_>>();

    Json(ToolsResponse { count: tools.len(), tools })
}
