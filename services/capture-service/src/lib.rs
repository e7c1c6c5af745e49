pub mod app_state;
pub mod capture_handlers;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod rate_limiter;
pub mod validation;

use axum::{
    extract::State,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, HeaderValue, Method,
    },
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use common_http_errors::ApiError;
use std::any::Any;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::error;

pub use common_money::AmountUnit;

pub use crate::app_state::AppState;
pub use crate::capture_handlers::{capture_payment, CAPTURE_ROUTE};
pub use crate::config::{ApiCredential, CaptureConfig, Environment};
pub use crate::gateway::{AuthStrategy, CaptureGateway, CaptureReceipt, GatewayError, HttpGatewayClient};
pub use crate::metrics::CaptureMetrics;
pub use crate::rate_limiter::{InMemoryRateLimiter, RateDecision, RateLimiterEngine};
pub use crate::validation::{CaptureRequest, Strictness, ValidationError, ValidationPolicy};

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "Failed to render metrics");
            ApiError::internal(None).into_response()
        }
    }
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    error!("Capture handler panicked");
    ApiError::internal(None).into_response()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("x-request-id"),
        ])
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allowed_origins);
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .route(CAPTURE_ROUTE, any(capture_payment))
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors)
}
