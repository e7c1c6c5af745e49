use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header::CONTENT_LENGTH, HeaderMap, Method},
    Json,
};
use common_http_errors::{ApiError, ApiResult, CaptureEnvelope};
use common_money::format_minor;
use http_body_util::LengthLimitError;
use serde_json::Value;
use std::error::Error as StdError;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::gateway::GatewayError;
use crate::rate_limiter::client_identity;

pub const CAPTURE_ROUTE: &str = "/api/capture";

/// Capture a previously authorized payment.
///
/// Gates run in a fixed order and the first failure wins: method, rate limit, body size,
/// credential presence, then payload validation. Only a request that passes all of them
/// reaches the gateway.
pub async fn capture_payment(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<CaptureEnvelope>> {
    let result = run_capture(&state, method, &headers, body).await;
    let outcome = match &result {
        Ok(_) => "captured",
        Err(err) => err.code(),
    };
    state.metrics.record_outcome(outcome);
    result
}

async fn run_capture(
    state: &AppState,
    method: Method,
    headers: &HeaderMap,
    body: Body,
) -> ApiResult<Json<CaptureEnvelope>> {
    if method != Method::POST {
        return Err(ApiError::MethodNotAllowed { allow: "POST" });
    }

    let client = client_identity(headers);
    let decision = state.rate_limiter.check(&client).await.map_err(|err| {
        error!(error = %err, "Rate limiter backend failed");
        ApiError::internal(None)
    })?;
    if !decision.allowed {
        state.metrics.record_rate_rejection();
        warn!(client = %client, current = decision.current, "Capture rate limit exceeded");
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after.map(|d| d.as_secs().max(1)),
        });
    }

    let limit = state.config.max_body_bytes;
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(ApiError::PayloadTooLarge { limit_bytes: limit });
    }
    let bytes = to_bytes(body, limit).await.map_err(|err| {
        if exceeded_length_limit(&err) {
            ApiError::PayloadTooLarge { limit_bytes: limit }
        } else {
            debug!(error = %err, "Failed to read capture body");
            ApiError::invalid_request("invalid_body", "Request body could not be read")
        }
    })?;

    let Some(credential) = state.config.credential.as_ref() else {
        error!("Gateway credential is not configured; rejecting capture");
        return Err(ApiError::ServerConfiguration { trace_id: None });
    };

    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::invalid_request("invalid_json", "Request body must be valid JSON"))?;
    let request = state
        .policy
        .validate_body(&payload)
        .map_err(|err| ApiError::invalid_request(err.code(), err.to_string()))?;

    let request_id = Uuid::new_v4();
    let started = Instant::now();
    let outcome = state
        .gateway
        .capture(request_id, credential.expose(), &request.transaction_id, request.amount_minor)
        .await;
    state.metrics.observe_gateway(started.elapsed(), outcome.is_ok());

    match outcome {
        Ok(receipt) => {
            info!(
                %request_id,
                transaction_id = %request.transaction_id,
                amount = %format_minor(request.amount_minor),
                status = receipt.status,
                "Payment captured"
            );
            Ok(Json(CaptureEnvelope::ok(Some(receipt.request_id.to_string()))))
        }
        Err(err) => {
            warn!(%request_id, transaction_id = %request.transaction_id, error = %err, "Payment capture failed");
            Err(map_gateway_error(err, request_id))
        }
    }
}

fn exceeded_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err as &(dyn StdError + 'static));
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

fn map_gateway_error(err: GatewayError, request_id: Uuid) -> ApiError {
    let trace_id = Some(request_id);
    match err {
        GatewayError::Configuration => ApiError::ServerConfiguration { trace_id },
        GatewayError::Authentication(_) => ApiError::Authentication { message: err.public_message(), trace_id },
        _ => ApiError::Gateway { message: err.public_message(), trace_id },
    }
}
