use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

/// Generic message for every fault the caller cannot act on.
pub const SERVER_ERROR_MESSAGE: &str = "Server error";

/// Response envelope shared by success and error paths.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CaptureEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl CaptureEnvelope {
    pub fn ok(request_id: Option<String>) -> Self {
        Self { success: true, error: None, request_id }
    }

    pub fn failed(error: impl Into<String>, request_id: Option<String>) -> Self {
        Self { success: false, error: Some(error.into()), request_id }
    }
}

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest { code: &'static str, message: String, trace_id: Option<Uuid> },
    MethodNotAllowed { allow: &'static str },
    RateLimited { retry_after_secs: Option<u64> },
    PayloadTooLarge { limit_bytes: usize },
    ServerConfiguration { trace_id: Option<Uuid> },
    Authentication { message: String, trace_id: Option<Uuid> },
    Gateway { message: String, trace_id: Option<Uuid> },
    Internal { trace_id: Option<Uuid> },
}

impl ApiError {
    pub fn invalid_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRequest { code, message: message.into(), trace_id: None }
    }

    pub fn internal(trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id } }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ServerConfiguration { .. }
            | ApiError::Authentication { .. }
            | ApiError::Gateway { .. }
            | ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, also sent as `X-Error-Code`.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest { code, .. } => *code,
            ApiError::MethodNotAllowed { .. } => "method_not_allowed",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::PayloadTooLarge { .. } => "payload_too_large",
            ApiError::ServerConfiguration { .. } => "server_configuration",
            ApiError::Authentication { .. } => "gateway_authentication",
            ApiError::Gateway { .. } => "gateway_error",
            ApiError::Internal { .. } => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest { message, .. } => message.clone(),
            ApiError::MethodNotAllowed { .. } => "Method not allowed".into(),
            ApiError::RateLimited { .. } => "Too many requests, please try again later".into(),
            ApiError::PayloadTooLarge { .. } => "Request body too large".into(),
            ApiError::ServerConfiguration { .. } => "Server configuration error".into(),
            ApiError::Authentication { message, .. } | ApiError::Gateway { message, .. } => message.clone(),
            ApiError::Internal { .. } => SERVER_ERROR_MESSAGE.into(),
        }
    }

    fn trace_id(&self) -> Option<Uuid> {
        match self {
            ApiError::InvalidRequest { trace_id, .. }
            | ApiError::ServerConfiguration { trace_id }
            | ApiError::Authentication { trace_id, .. }
            | ApiError::Gateway { trace_id, .. }
            | ApiError::Internal { trace_id } => *trace_id,
            _ => None,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = CaptureEnvelope::failed(self.message(), self.trace_id().map(|id| id.to_string()));
        let mut resp = (status, Json(body)).into_response();
        let headers = resp.headers_mut();
        if let Ok(val) = HeaderValue::from_str(code) {
            headers.insert("X-Error-Code", val);
        }
        match self {
            ApiError::MethodNotAllowed { allow } => {
                headers.insert(header::ALLOW, HeaderValue::from_static(allow));
            }
            ApiError::RateLimited { retry_after_secs: Some(secs) } => {
                if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
                    headers.insert(header::RETRY_AFTER, val);
                }
            }
            _ => {}
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
