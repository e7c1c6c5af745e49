use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, redirect::Policy, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CaptureConfig;

pub const AUTH_TOKENS_PATH: &str = "/api/auth/tokens";
pub const CAPTURE_PATH: &str = "/api/acceptance/capture";
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
/// Upper bound on any gateway response body we are willing to buffer.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;
pub const FALLBACK_ERROR_MESSAGE: &str = "Payment capture failed";
const MAX_ERROR_MESSAGE_CHARS: usize = 200;
const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Exchange the API key for a short-lived token, then send the token in the capture body.
    TokenExchange,
    /// Send the secret key as `Authorization: Token <secret>` on the capture call.
    StaticBearer,
}

#[derive(Debug, Error)]
#[error("unknown auth strategy: {0}")]
pub struct UnknownAuthStrategy(String);

impl FromStr for AuthStrategy {
    type Err = UnknownAuthStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "token_exchange" | "token" => Ok(AuthStrategy::TokenExchange),
            "static_bearer" | "bearer" | "static" => Ok(AuthStrategy::StaticBearer),
            other => Err(UnknownAuthStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway credential is not configured")]
    Configuration,
    #[error("invalid capture input: {0}")]
    InvalidInput(&'static str),
    #[error("gateway authentication failed: {0}")]
    Authentication(String),
    #[error("gateway rejected capture with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway transport failure: {0}")]
    Transport(String),
    #[error("gateway response exceeded the size limit")]
    ResponseTooLarge,
    #[error("gateway returned a malformed response")]
    MalformedResponse,
}

impl GatewayError {
    /// Text safe to return to the caller.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Configuration => "Server configuration error".into(),
            GatewayError::InvalidInput(what) => format!("Invalid {what}"),
            GatewayError::Authentication(_) => "Payment gateway authentication failed".into(),
            GatewayError::Rejected { message, .. } => message.clone(),
            GatewayError::Timeout => "Payment gateway timed out".into(),
            GatewayError::Transport(_) => "Payment gateway unavailable".into(),
            GatewayError::ResponseTooLarge | GatewayError::MalformedResponse => {
                "Invalid response from payment gateway".into()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReceipt {
    pub request_id: Uuid,
    pub status: u16,
}

#[async_trait]
pub trait CaptureGateway: Send + Sync {
    /// `request_id` is sent as `X-Request-ID` and echoed in the receipt.
    async fn capture(
        &self,
        request_id: Uuid,
        credential: &str,
        transaction_id: &str,
        amount_minor: i64,
    ) -> Result<CaptureReceipt, GatewayError>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    api_key: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<Value>,
}

#[derive(Serialize)]
struct CapturePayload<'a> {
    transaction_id: &'a str,
    amount_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<&'a str>,
}

/// Error schema the gateway returns on non-success statuses.
#[derive(Debug, Default, Deserialize)]
pub struct GatewayErrorBody {
    #[serde(default)]
    pub detail: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
}

impl GatewayErrorBody {
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    /// Fields in the order they are consulted.
    pub fn candidates(&self) -> [Option<&Value>; 2] {
        [self.detail.as_ref(), self.message.as_ref()]
    }

    /// First non-blank string candidate, or [`FALLBACK_ERROR_MESSAGE`].
    pub fn best_message(&self) -> &str {
        self.candidates()
            .into_iter()
            .flatten()
            .find_map(|value| value.as_str().map(str::trim).filter(|s| !s.is_empty()))
            .unwrap_or(FALLBACK_ERROR_MESSAGE)
    }
}

/// Bound the length of an upstream message and scrub known secrets from it.
pub fn scrub_message(message: &str, secrets: &[&str]) -> String {
    let mut scrubbed = message.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        scrubbed = scrubbed.replace(secret, REDACTED);
    }
    if scrubbed.chars().count() > MAX_ERROR_MESSAGE_CHARS {
        scrubbed = scrubbed.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
    }
    scrubbed
}

fn map_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(err.without_url().to_string())
    }
}

async fn read_bounded(mut response: Response) -> Result<Vec<u8>, GatewayError> {
    if response.content_length().is_some_and(|len| len > MAX_RESPONSE_BYTES as u64) {
        return Err(GatewayError::ResponseTooLarge);
    }
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(map_transport)? {
        if buf.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(GatewayError::ResponseTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

#[derive(Clone)]
pub struct HttpGatewayClient {
    client: Client,
    base_url: String,
    strategy: AuthStrategy,
    log_upstream_bodies: bool,
}

impl HttpGatewayClient {
    pub fn new(base_url: impl Into<String>, strategy: AuthStrategy, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .context("Failed to build gateway HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            strategy,
            log_upstream_bodies: false,
        })
    }

    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        Ok(Self::new(&config.gateway_base_url, config.auth_strategy, config.gateway_timeout)?
            .with_upstream_body_logging(!config.environment.is_production()))
    }

    /// Log raw upstream error bodies at debug level. Never enable in production.
    pub fn with_upstream_body_logging(mut self, enabled: bool) -> Self {
        self.log_upstream_bodies = enabled;
        self
    }

    async fn post_json<B: Serialize>(
        &self,
        path: &str,
        request_id: Uuid,
        body: &B,
        secret_header: Option<&str>,
    ) -> Result<(StatusCode, Vec<u8>), GatewayError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .json(body);
        if let Some(secret) = secret_header {
            request = request.header(AUTHORIZATION, format!("Token {secret}"));
        }
        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();
        let bytes = read_bounded(response).await?;
        Ok((status, bytes))
    }

    async fn exchange_token(&self, credential: &str, request_id: Uuid) -> Result<String, GatewayError> {
        let (status, body) = self
            .post_json(AUTH_TOKENS_PATH, request_id, &TokenRequest { api_key: credential }, None)
            .await?;
        if !status.is_success() {
            let message = scrub_message(GatewayErrorBody::parse(&body).best_message(), &[credential]);
            self.log_upstream(request_id, status, &body, &[credential]);
            return Err(GatewayError::Authentication(format!("status {}: {}", status.as_u16(), message)));
        }
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|_| GatewayError::Authentication("token response is not valid JSON".into()))?;
        parsed
            .token
            .as_ref()
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Authentication("token missing from response".into()))
    }

    fn log_upstream(&self, request_id: Uuid, status: StatusCode, body: &[u8], secrets: &[&str]) {
        if self.log_upstream_bodies {
            let raw = String::from_utf8_lossy(body);
            debug!(%request_id, status = status.as_u16(), body = %scrub_message(&raw, secrets), "Gateway error body");
        }
    }
}

#[async_trait]
impl CaptureGateway for HttpGatewayClient {
    async fn capture(
        &self,
        request_id: Uuid,
        credential: &str,
        transaction_id: &str,
        amount_minor: i64,
    ) -> Result<CaptureReceipt, GatewayError> {
        if credential.trim().is_empty() {
            return Err(GatewayError::Configuration);
        }
        if transaction_id.trim().is_empty() {
            return Err(GatewayError::InvalidInput("transaction id"));
        }
        if amount_minor <= 0 {
            return Err(GatewayError::InvalidInput("amount"));
        }

        info!(%request_id, transaction_id, amount_minor, strategy = ?self.strategy, "Submitting capture to gateway");

        let (token, secret_header) = match self.strategy {
            AuthStrategy::TokenExchange => (Some(self.exchange_token(credential, request_id).await?), None),
            AuthStrategy::StaticBearer => (None, Some(credential)),
        };
        let payload = CapturePayload {
            transaction_id,
            amount_cents: amount_minor,
            auth_token: token.as_deref(),
        };
        let (status, body) = self.post_json(CAPTURE_PATH, request_id, &payload, secret_header).await?;

        let mut secrets = vec![credential];
        if let Some(token) = token.as_deref() {
            secrets.push(token);
        }

        if matches!(status, StatusCode::OK | StatusCode::CREATED) {
            if serde_json::from_slice::<Value>(&body).is_err() {
                warn!(%request_id, status = status.as_u16(), "Gateway success response was not JSON");
                return Err(GatewayError::MalformedResponse);
            }
            info!(%request_id, status = status.as_u16(), "Gateway accepted capture");
            return Ok(CaptureReceipt { request_id, status: status.as_u16() });
        }

        let message = scrub_message(GatewayErrorBody::parse(&body).best_message(), &secrets);
        warn!(%request_id, status = status.as_u16(), error = %message, "Gateway rejected capture");
        self.log_upstream(request_id, status, &body, &secrets);
        Err(GatewayError::Rejected { status: status.as_u16(), message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Instant;

    fn client(server: &MockServer, strategy: AuthStrategy) -> HttpGatewayClient {
        HttpGatewayClient::new(server.base_url(), strategy, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("token_exchange".parse::<AuthStrategy>().unwrap(), AuthStrategy::TokenExchange);
        assert_eq!("Static-Bearer".parse::<AuthStrategy>().unwrap(), AuthStrategy::StaticBearer);
        assert!("oauth".parse::<AuthStrategy>().is_err());
    }

    #[test]
    fn error_body_priority_detail_then_message_then_fallback() {
        let both = GatewayErrorBody::parse(br#"{"detail":"d","message":"m"}"#);
        assert_eq!(both.best_message(), "d");
        let message_only = GatewayErrorBody::parse(br#"{"message":"m"}"#);
        assert_eq!(message_only.best_message(), "m");
        let blank_detail = GatewayErrorBody::parse(br#"{"detail":"  ","message":"m"}"#);
        assert_eq!(blank_detail.best_message(), "m");
        let object_detail = GatewayErrorBody::parse(br#"{"detail":{"code":1}}"#);
        assert_eq!(object_detail.best_message(), FALLBACK_ERROR_MESSAGE);
        let not_json = GatewayErrorBody::parse(b"<html>502</html>");
        assert_eq!(not_json.best_message(), FALLBACK_ERROR_MESSAGE);
    }

    #[test]
    fn scrub_redacts_and_truncates() {
        assert_eq!(scrub_message("bad key sk_1 given", &["sk_1"]), "bad key [redacted] given");
        assert_eq!(scrub_message("x", &[""]), "x");
        assert_eq!(scrub_message(&"y".repeat(500), &[]).chars().count(), 200);
    }

    #[tokio::test]
    async fn static_bearer_created_is_success() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(CAPTURE_PATH)
                    .header("Authorization", "Token sk_test")
                    .header_exists(REQUEST_ID_HEADER)
                    .json_body(json!({"transaction_id": "TXN12345", "amount_cents": 100}));
                then.status(201).json_body(json!({"id": 991, "success": true}));
            })
            .await;

        let receipt = client(&server, AuthStrategy::StaticBearer)
            .capture(Uuid::new_v4(), "sk_test", "TXN12345", 100)
            .await
            .unwrap();
        assert_eq!(receipt.status, 201);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn ok_status_is_also_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(CAPTURE_PATH);
                then.status(200).json_body(json!({}));
            })
            .await;
        let receipt = client(&server, AuthStrategy::StaticBearer).capture(Uuid::new_v4(), "k", "TXN12345", 1).await.unwrap();
        assert_eq!(receipt.status, 200);
    }

    #[tokio::test]
    async fn other_2xx_is_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(CAPTURE_PATH);
                then.status(202).json_body(json!({"message": "queued"}));
            })
            .await;
        let err = client(&server, AuthStrategy::StaticBearer).capture(Uuid::new_v4(), "k", "TXN12345", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 202, .. }));
    }

    #[tokio::test]
    async fn token_exchange_sends_token_in_body() {
        let server = MockServer::start_async().await;
        let auth = server
            .mock_async(|when, then| {
                when.method(POST).path(AUTH_TOKENS_PATH).json_body(json!({"api_key": "api_123"}));
                then.status(201).json_body(json!({"token": "tok_abc"}));
            })
            .await;
        let capture = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(CAPTURE_PATH)
                    .json_body(json!({"transaction_id": "TXN12345", "amount_cents": 2500, "auth_token": "tok_abc"}));
                then.status(201).json_body(json!({"success": true}));
            })
            .await;

        let gateway = client(&server, AuthStrategy::TokenExchange);
        assert!(gateway.capture(Uuid::new_v4(), "api_123", "TXN12345", 2500).await.is_ok());
        auth.assert_async().await;
        capture.assert_async().await;
    }

    #[tokio::test]
    async fn token_exchange_without_token_is_auth_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(AUTH_TOKENS_PATH);
                then.status(201).json_body(json!({"profile": {}}));
            })
            .await;
        let capture = server
            .mock_async(|when, then| {
                when.method(POST).path(CAPTURE_PATH);
                then.status(201).json_body(json!({}));
            })
            .await;

        let err = client(&server, AuthStrategy::TokenExchange).capture(Uuid::new_v4(), "api_123", "TXN12345", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
        assert_eq!(capture.hits_async().await, 0);
    }

    #[tokio::test]
    async fn token_exchange_rejected_key_is_auth_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(AUTH_TOKENS_PATH);
                then.status(403).json_body(json!({"detail": "api_123 is not valid"}));
            })
            .await;
        let err = client(&server, AuthStrategy::TokenExchange).capture(Uuid::new_v4(), "api_123", "TXN12345", 1).await.unwrap_err();
        match err {
            GatewayError::Authentication(msg) => {
                assert!(msg.contains("403"));
                assert!(!msg.contains("api_123"), "credential leaked: {msg}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_carries_detail_or_message() {
        for (status, body, expected) in [
            (400, json!({"detail": "Transaction not found", "message": "ignored"}), "Transaction not found"),
            (401, json!({"message": "Unauthorized"}), "Unauthorized"),
            (500, json!({"error": "boom"}), FALLBACK_ERROR_MESSAGE),
        ] {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST).path(CAPTURE_PATH);
                    then.status(status).json_body(body.clone());
                })
                .await;
            let err = client(&server, AuthStrategy::StaticBearer).capture(Uuid::new_v4(), "k", "TXN12345", 1).await.unwrap_err();
            match err {
                GatewayError::Rejected { status: got, message } => {
                    assert_eq!(got, status);
                    assert_eq!(message, expected);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn rejection_message_never_echoes_secret() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(CAPTURE_PATH);
                then.status(401).json_body(json!({"detail": "Invalid token sk_live_secret"}));
            })
            .await;
        let err = client(&server, AuthStrategy::StaticBearer)
            .capture(Uuid::new_v4(), "sk_live_secret", "TXN12345", 1)
            .await
            .unwrap_err();
        assert!(!err.public_message().contains("sk_live_secret"));
        assert!(err.public_message().contains("[redacted]"));
    }

    #[tokio::test]
    async fn non_json_success_is_malformed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(CAPTURE_PATH);
                then.status(201).body("created");
            })
            .await;
        let err = client(&server, AuthStrategy::StaticBearer).capture(Uuid::new_v4(), "k", "TXN12345", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse));
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let server = MockServer::start_async().await;
        let target = server
            .mock_async(|when, then| {
                when.path("/elsewhere");
                then.status(201).json_body(json!({}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(CAPTURE_PATH);
                then.status(302).header("Location", "/elsewhere");
            })
            .await;
        let err = client(&server, AuthStrategy::StaticBearer).capture(Uuid::new_v4(), "k", "TXN12345", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 302, .. }));
        assert_eq!(target.hits_async().await, 0);
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(CAPTURE_PATH);
                then.status(400).body("x".repeat(MAX_RESPONSE_BYTES + 1));
            })
            .await;
        let err = client(&server, AuthStrategy::StaticBearer).capture(Uuid::new_v4(), "k", "TXN12345", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn slow_gateway_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(CAPTURE_PATH);
                then.status(201).json_body(json!({})).delay(Duration::from_secs(3));
            })
            .await;
        let gateway =
            HttpGatewayClient::new(server.base_url(), AuthStrategy::StaticBearer, Duration::from_millis(200)).unwrap();
        let started = Instant::now();
        let err = gateway.capture(Uuid::new_v4(), "k", "TXN12345", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_transport_error() {
        let gateway =
            HttpGatewayClient::new("http://127.0.0.1:9", AuthStrategy::StaticBearer, Duration::from_secs(2)).unwrap();
        let err = gateway.capture(Uuid::new_v4(), "k", "TXN12345", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_) | GatewayError::Timeout));
        assert_eq!(err.public_message(), match err {
            GatewayError::Timeout => "Payment gateway timed out",
            _ => "Payment gateway unavailable",
        });
    }

    #[tokio::test]
    async fn preconditions_fail_before_network() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.any_request();
                then.status(201).json_body(json!({}));
            })
            .await;
        let gateway = client(&server, AuthStrategy::TokenExchange);
        assert!(matches!(gateway.capture(Uuid::new_v4(), "", "TXN12345", 1).await, Err(GatewayError::Configuration)));
        assert!(matches!(gateway.capture(Uuid::new_v4(), "k", " ", 1).await, Err(GatewayError::InvalidInput(_))));
        assert!(matches!(gateway.capture(Uuid::new_v4(), "k", "TXN12345", 0).await, Err(GatewayError::InvalidInput(_))));
        assert_eq!(mock.hits_async().await, 0);
    }
}
