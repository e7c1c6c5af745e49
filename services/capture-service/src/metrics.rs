use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

#[derive(Clone)]
pub struct CaptureMetrics {
    registry: Registry,
    requests: IntCounterVec,
    rate_rejections: IntCounter,
    gateway_duration: HistogramVec,
}

impl CaptureMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("capture_requests_total", "Capture requests grouped by outcome"),
            &["outcome"],
        )?;
        let rate_rejections = IntCounter::with_opts(Opts::new(
            "capture_rate_limit_rejections_total",
            "Capture requests rejected by the rate limiter",
        ))?;
        let gateway_duration = HistogramVec::new(
            HistogramOpts::new("capture_gateway_duration_seconds", "Latency of gateway capture calls")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0]),
            &["result"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rate_rejections.clone()))?;
        registry.register(Box::new(gateway_duration.clone()))?;
        Ok(Self {
            registry,
            requests,
            rate_rejections,
            gateway_duration,
        })
    }

    /// `outcome` is a fixed label such as `captured` or an error code, never caller input.
    pub fn record_outcome(&self, outcome: &str) {
        self.requests.with_label_values(&[outcome]).inc();
    }

    pub fn record_rate_rejection(&self) {
        self.rate_rejections.inc();
    }

    pub fn observe_gateway(&self, elapsed: Duration, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.gateway_duration
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
    }

    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.requests.with_label_values(&[outcome]).get()
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
