use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth::require_shared_secret;
use crate::state::AppState;
use crate::{cache, chat, health};

/// `/health` stays open; everything else sits behind the shared secret.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/tools", get(health::list_tools))
        .route("/chat", post(chat::chat))
        .route("/cache/refresh", post(cache::refresh))
        .route("/cache/stats", get(cache::stats))
        .route("/cache/clear", post(cache::clear))
        .route_layer(middleware::from_fn_with_state(state.secret.clone(), require_shared_secret));

    Router::new().route("/health", get(health::health)).merge(protected).with_state(state)
}
