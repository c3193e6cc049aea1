use axum::{Json, extract::State, response::IntoResponse};
use std::sync::Arc;

use crate::state::AppState;

// Liveness plus a rough picture of the in-process state
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let upstreams = state.load_balancer.as_ref().map_or(0, |lb| {
        lb.all_upstreams().iter().filter(|u| u.is_healthy()).count()
    });
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "cache": state.cache.backend(),
        "healthyUpstreams": upstreams,
        "trackedIps": state.guard.ledger().len(),
    }))
}
