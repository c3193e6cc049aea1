pub mod bot;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod counter_store;
pub mod error;
pub mod fingerprint;
pub mod handlers;
pub mod load_balancer;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod state;
pub mod suspicion;
pub mod sweep;

use axum::{
    Router, middleware,
    routing::{any, get},
};
use std::sync::Arc;

use handlers::{health_handler, honeypot_handler, metrics_handler, not_found_handler, proxy_handler};
use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let guarded = pipeline::protect(
        Router::new()
            .route("/api/{*path}", any(proxy_handler))
            .fallback(not_found_handler),
        Arc::clone(&state.guard),
        &state.limiters(),
    );

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));
    for path in &state.config.honeypot.paths {
        app = app.route(path, any(honeypot_handler));
    }

    app.merge(guarded)
        .layer(middleware::from_fn(pipeline::security_headers))
        .with_state(state)
}
