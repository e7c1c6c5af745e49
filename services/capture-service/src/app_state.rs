use anyhow::Result;
use std::sync::Arc;

use crate::config::CaptureConfig;
use crate::gateway::{CaptureGateway, HttpGatewayClient};
use crate::metrics::CaptureMetrics;
use crate::rate_limiter::{InMemoryRateLimiter, RateLimiterEngine};
use crate::validation::ValidationPolicy;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CaptureConfig>,
    pub policy: Arc<ValidationPolicy>,
    pub rate_limiter: Arc<dyn RateLimiterEngine>,
    pub gateway: Arc<dyn CaptureGateway>,
    pub metrics: Arc<CaptureMetrics>,
}

impl AppState {
    pub fn new(
        config: CaptureConfig,
        rate_limiter: Arc<dyn RateLimiterEngine>,
        gateway: Arc<dyn CaptureGateway>,
    ) -> Result<Self> {
        Ok(Self {
            policy: Arc::new(config.validation_policy()),
            config: Arc::new(config),
            rate_limiter,
            gateway,
            metrics: Arc::new(CaptureMetrics::new()?),
        })
    }

    /// In-process limiter and the HTTP gateway client described by `config`.
    pub fn in_memory(config: CaptureConfig) -> Result<Self> {
        let limiter = Arc::new(InMemoryRateLimiter::new(
            config.rate_limit,
            config.rate_limit_window_secs,
        ));
        let gateway = Arc::new(HttpGatewayClient::from_config(&config)?);
        Self::new(config, limiter, gateway)
    }
}
