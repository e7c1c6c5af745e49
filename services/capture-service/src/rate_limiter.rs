use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// Redis dependencies (only used by Redis implementation)
use redis::aio::ConnectionManager;
use redis::Script;

/// Shared bucket for callers that present no address headers.
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests counted in the window, including this one when allowed.
    pub current: u32,
    /// Time until the oldest counted request leaves the window, when denied.
    pub retry_after: Option<Duration>,
}

/// Sliding-window limiter keyed by client identity.
///
/// The handler only sees this trait, so the in-process store can be replaced by a shared
/// one for multi-instance deployments.
#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn check(&self, key: &str) -> Result<RateDecision>;
}

/// Derive the limiter key: first `X-Forwarded-For` hop, then `X-Real-IP`, then [`UNKNOWN_CLIENT`].
pub fn client_identity(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = || {
        headers
            .get("X-Real-IP")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    forwarded
        .or_else(real_ip)
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

// ---------------- In-Memory Implementation ----------------

struct Buckets {
    clients: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl Buckets {
    /// Drop clients whose newest request has left the window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        self.clients.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < window)
        });
        self.last_sweep = now;
    }
}

#[derive(Clone)]
pub struct InMemoryRateLimiter {
    inner: Arc<Mutex<Buckets>>,
    limit: u32,
    window: Duration,
}

impl InMemoryRateLimiter {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buckets {
                clients: HashMap::new(),
                last_sweep: Instant::now(),
            })),
            limit: limit.max(1),
            window: Duration::from_secs(window_secs.max(1)),
        }
    }

    /// Prune, count and record under one lock so concurrent callers cannot both see "under cap".
    /// Idle clients are swept at most once per window.
    pub async fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut guard = self.inner.lock().await;
        if now.saturating_duration_since(guard.last_sweep) >= self.window {
            guard.sweep(now, self.window);
        }
        let entries = guard.clients.entry(key.to_string()).or_default();
        while let Some(oldest) = entries.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
        let counted = entries.len() as u32;
        if counted >= self.limit {
            let retry_after = entries
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now));
            return RateDecision { allowed: false, current: counted, retry_after };
        }
        entries.push_back(now);
        RateDecision { allowed: true, current: counted + 1, retry_after: None }
    }

    /// Number of keys currently tracked.
    pub async fn tracked_clients(&self) -> usize {
        self.inner.lock().await.clients.len()
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn check(&self, key: &str) -> Result<RateDecision> {
        Ok(self.check_at(key, Instant::now()).await)
    }
}

// ---------------- Redis Implementation ----------------

// KEYS[1] sorted set of request timestamps (ms)
// ARGV: now_ms, window_ms, limit, member
const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[2]))
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  local retry = 0
  if oldest[2] then retry = tonumber(oldest[2]) + tonumber(ARGV[2]) - tonumber(ARGV[1]) end
  return {0, count, retry}
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return {1, count + 1, 0}
"#;

#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    script: Arc<Script>,
    limit: u32,
    window: Duration,
    prefix: String,
}

impl RedisRateLimiter {
    pub async fn new(redis_url: &str, limit: u32, window_secs: u64, prefix: String) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self {
            manager,
            script: Arc::new(Script::new(SLIDING_WINDOW_SCRIPT)),
            limit: limit.max(1),
            window: Duration::from_secs(window_secs.max(1)),
            prefix,
        })
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn check(&self, key: &str) -> Result<RateDecision> {
        let redis_key = format!("{}:{}", self.prefix, key);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
        let mut conn = self.manager.clone();
        let (allowed, current, retry_ms): (i64, i64, i64) = self
            .script
            .key(&redis_key)
            .arg(now_ms)
            .arg(self.window.as_millis() as i64)
            .arg(self.limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .context("Rate limit script failed")?;
        Ok(RateDecision {
            allowed: allowed == 1,
            current: current.max(0) as u32,
            retry_after: (allowed != 1).then(|| Duration::from_millis(retry_ms.max(0) as u64)),
        })
    }
}

/// Pick the backend from configuration: Redis when a URL is set, in-process otherwise.
pub async fn from_config(config: &crate::config::CaptureConfig) -> Result<Arc<dyn RateLimiterEngine>> {
    match &config.redis_url {
        Some(url) => {
            let limiter = RedisRateLimiter::new(
                url,
                config.rate_limit,
                config.rate_limit_window_secs,
                config.redis_prefix.clone(),
            )
            .await?;
            Ok(Arc::new(limiter))
        }
        None => Ok(Arc::new(InMemoryRateLimiter::new(
            config.rate_limit,
            config.rate_limit_window_secs,
        ))),
    }
}
