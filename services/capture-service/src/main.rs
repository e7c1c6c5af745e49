use anyhow::Context;
use capture_service::{build_router, rate_limiter, AppState, CaptureConfig, HttpGatewayClient};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CaptureConfig::from_env().context("Failed to load capture-service configuration")?;
    if config.credential.is_none() {
        error!("GATEWAY_API_KEY is not set; every capture will fail with a configuration error");
    }
    if !config.environment.is_production() {
        warn!(environment = ?config.environment, "Upstream error bodies will be logged at debug level");
    }

    let rate_limiter = rate_limiter::from_config(&config).await?;
    info!(
        limit = config.rate_limit,
        window_secs = config.rate_limit_window_secs,
        backend = if config.redis_url.is_some() { "redis" } else { "memory" },
        "Capture rate limiter initialised"
    );
    let gateway = Arc::new(HttpGatewayClient::from_config(&config)?);
    info!(
        base_url = %config.gateway_base_url,
        strategy = ?config.auth_strategy,
        timeout_secs = config.gateway_timeout.as_secs(),
        amount_unit = config.amount_unit.as_str(),
        "Gateway client initialised"
    );

    let state = AppState::new(config, rate_limiter, gateway)?;
    let app = build_router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8087);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    info!(%addr, "starting capture-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
