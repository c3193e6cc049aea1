use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use about_town_gateway::{
    build_router, clock,
    config::{Args, GatewayConfig},
    load_balancer::health_checker,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = GatewayConfig::try_from(args).context("invalid configuration")?;
    let port = config.port;
    let health_interval = config.health_interval;

    let state = Arc::new(AppState::new(config, clock::system()).context("failed to build http client")?);

    if let Some(lb) = &state.load_balancer {
        tokio::spawn(health_checker(Arc::clone(lb), state.client.clone(), health_interval));
    } else {
        info!("no upstreams configured, /api requests will answer 503");
    }

    info!(
        port,
        cache = state.cache.backend(),
        cache_ttl = state.config.cache_ttl,
        rate_limit = state.config.api_rate.max_requests,
        rate_window = ?state.config.api_rate.window,
        strict_mode = state.config.strict.enabled,
        block_threshold = state.config.suspicion.block_threshold,
        "gateway configured"
    );

    let app = build_router(Arc::clone(&state));
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("gateway running on http://localhost:{port}");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;
    Ok(())
}
