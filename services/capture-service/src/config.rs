use anyhow::{anyhow, Context, Result};
use common_money::AmountUnit;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::gateway::AuthStrategy;
use crate::validation::{Strictness, ValidationPolicy};

/// Static secret proving our identity to the payment gateway.
///
/// `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential(String);

impl ApiCredential {
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str { &self.0 }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("ApiCredential(***)") }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn is_production(&self) -> bool { matches!(self, Environment::Production) }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" | "test" | "staging" => Ok(Environment::Development),
            other => Err(anyhow!("unknown environment '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub gateway_base_url: String,
    pub credential: Option<ApiCredential>,
    pub auth_strategy: AuthStrategy,
    pub gateway_timeout: Duration,
    pub amount_unit: AmountUnit,
    pub strictness: Strictness,
    pub max_body_bytes: usize,
    pub rate_limit: u32,
    pub rate_limit_window_secs: u64,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub environment: Environment,
    pub cors_allowed_origins: Vec<String>,
}

pub const DEFAULT_MAX_BODY_BYTES: usize = 512 * 1024;
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 15;

impl CaptureConfig {
    pub fn from_env() -> Result<Self> {
        let gateway_base_url = env::var("GATEWAY_BASE_URL")
            .unwrap_or_else(|_| "https://accept.paymob.com".to_string())
            .trim_end_matches('/')
            .to_string();
        let credential = env::var("GATEWAY_API_KEY")
            .or_else(|_| env::var("GATEWAY_SECRET_KEY"))
            .ok()
            .and_then(ApiCredential::new);
        let auth_strategy = env::var("GATEWAY_AUTH_STRATEGY")
            .ok()
            .map(|value| value.parse::<AuthStrategy>())
            .transpose()
            .context("Failed to parse GATEWAY_AUTH_STRATEGY")?
            .unwrap_or(AuthStrategy::StaticBearer);
        let gateway_timeout_secs = env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_GATEWAY_TIMEOUT_SECS);
        let amount_unit = env::var("CAPTURE_AMOUNT_UNIT")
            .ok()
            .map(|value| value.parse::<AmountUnit>())
            .transpose()
            .context("Failed to parse CAPTURE_AMOUNT_UNIT")?
            .unwrap_or(AmountUnit::MinorInteger);
        let strictness = env::var("CAPTURE_VALIDATION")
            .ok()
            .map(|value| value.parse::<Strictness>())
            .transpose()
            .context("Failed to parse CAPTURE_VALIDATION")?
            .unwrap_or(Strictness::Strict);
        let max_body_bytes = env::var("CAPTURE_MAX_BODY_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);
        let rate_limit = env::var("CAPTURE_RATE_LIMIT")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(5);
        let rate_limit_window_secs = env::var("CAPTURE_RATE_LIMIT_WINDOW_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(60);
        let redis_url = env::var("REDIS_URL").ok().filter(|value| !value.trim().is_empty());
        let redis_prefix = env::var("CAPTURE_RATE_LIMIT_PREFIX")
            .unwrap_or_else(|_| "capture-service:rate".to_string());
        let environment = env::var("CAPTURE_ENV")
            .ok()
            .map(|value| value.parse::<Environment>())
            .transpose()
            .context("Failed to parse CAPTURE_ENV")?
            .unwrap_or(Environment::Production);
        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec!["http://localhost:3000".to_string()]);

        Ok(Self {
            gateway_base_url,
            credential,
            auth_strategy,
            gateway_timeout: Duration::from_secs(gateway_timeout_secs.clamp(1, 60)),
            amount_unit,
            strictness,
            max_body_bytes: max_body_bytes.max(1024),
            rate_limit: rate_limit.max(1),
            rate_limit_window_secs: rate_limit_window_secs.max(1),
            redis_url,
            redis_prefix,
            environment,
            cors_allowed_origins,
        })
    }

    /// Defaults suitable for tests: in-memory limiter, strict minor-unit validation.
    pub fn for_gateway(gateway_base_url: impl Into<String>, credential: Option<&str>) -> Self {
        Self {
            gateway_base_url: gateway_base_url.into(),
            credential: credential.and_then(ApiCredential::new),
            auth_strategy: AuthStrategy::StaticBearer,
            gateway_timeout: Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS),
            amount_unit: AmountUnit::MinorInteger,
            strictness: Strictness::Strict,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            rate_limit: 5,
            rate_limit_window_secs: 60,
            redis_url: None,
            redis_prefix: "capture-service:rate".to_string(),
            environment: Environment::Development,
            cors_allowed_origins: Vec::new(),
        }
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy::new(self.strictness, self.amount_unit)
    }
}
