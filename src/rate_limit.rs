use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::clock::{self, SharedClock};
use crate::client;
use crate::counter_store::TimedCounterStore;
use crate::error::Denial;
use crate::metrics;

pub type KeyGenerator = Arc<dyn Fn(&Request) -> String + Send + Sync>;

const DEFAULT_MESSAGE: &str = "Too many requests from this IP, please try again later.";

#[derive(Clone)]
pub struct RateLimitOptions {
    pub window: Duration,
    pub max_requests: u64,
    pub key_generator: Option<KeyGenerator>,
    pub message: Option<String>,
    pub skip_successful_requests: bool,
    // Leave GET/HEAD/OPTIONS alone
    pub writes_only: bool,
    pub trust_proxy: bool,
}

impl fmt::Debug for RateLimitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitOptions")
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("custom_key", &self.key_generator.is_some())
            .field("message", &self.message)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("writes_only", &self.writes_only)
            .finish()
    }
}

impl RateLimitOptions {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            window,
            max_requests,
            key_generator: None,
            message: None,
            skip_successful_requests: false,
            writes_only: false,
            trust_proxy: true,
        }
    }

    // 100 requests per 15 minutes for general API traffic
    pub fn api() -> Self {
        Self::new(100, Duration::from_secs(15 * 60))
    }

    // Comments, votes and stars
    pub fn strict() -> Self {
        let mut options = Self::new(20, Duration::from_secs(15 * 60));
        options.writes_only = true;
        options.message = Some("Too many write requests, please slow down.".to_string());
        options
    }

    pub fn key_generator(mut self, f: impl Fn(&Request) -> String + Send + Sync + 'static) -> Self {
        self.key_generator = Some(Arc::new(f));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }

    fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub key: String,
    pub count: u64,
    pub reset_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub count: u64,
    pub remaining: u64,
    pub reset_at: u64,
    pub retry_after: u64,
    window_start: u64,
}

impl RateDecision {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        if let Ok(reset) = HeaderValue::from_str(&clock::to_rfc3339(self.reset_at)) {
            headers.insert("x-ratelimit-reset", reset);
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    options: RateLimitOptions,
    store: TimedCounterStore,
}

impl RateLimiter {
    pub fn new(name: &'static str, options: RateLimitOptions, clock: SharedClock) -> Self {
        Self {
            name,
            options,
            store: TimedCounterStore::new(clock),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    pub fn key_for(&self, req: &Request) -> String {
        match &self.options.key_generator {
            Some(generate) => generate(req),
            None => client::request_ip(req, self.options.trust_proxy),
        }
    }

    fn applies_to(&self, method: &Method) -> bool {
        !self.options.writes_only || !method.is_safe()
    }

    // Counts one request against `key`. The request that pushes the count
    // past `max_requests` is the first one denied.
    pub fn hit(&self, key: &str) -> RateDecision {
        let record = self.store.increment_record(key, self.options.window_ms());
        let now = self.store.now_ms();
        let limit = self.options.max_requests;
        let reset_at = record.expires_at();
        RateDecision {
            allowed: record.count <= limit,
            limit,
            count: record.count,
            remaining: limit.saturating_sub(record.count),
            reset_at,
            retry_after: clock::secs_until(now, reset_at).max(1),
            window_start: record.window_start,
        }
    }

    // Gives the slot back. Only affects later requests of the same window.
    pub fn refund(&self, key: &str, decision: &RateDecision) {
        self.store.decrement_in_window(key, decision.window_start);
    }

    pub fn bucket(&self, key: &str) -> Option<RateLimitBucket> {
        self.store.record(key).map(|r| RateLimitBucket {
            key: key.to_string(),
            count: r.count,
            reset_at: r.expires_at(),
        })
    }

    pub fn reset(&self, key: &str) {
        self.store.reset(key);
    }

    pub fn cleanup(&self) -> usize {
        use crate::sweep::Sweep;
        self.store.sweep(self.store.now_ms())
    }

    fn deny(&self, decision: &RateDecision) -> Response {
        let message = self
            .options
            .message
            .clone()
            .unwrap_or_else(|| DEFAULT_MESSAGE.to_string());
        let mut response = Denial::too_many_requests(decision.retry_after)
            .with_message(message)
            .with_limit(decision.limit, self.options.window_ms())
            .into_response();
        decision.apply_headers(response.headers_mut());
        response
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    limiter.cleanup();

    if !limiter.applies_to(req.method()) {
        return next.run(req).await;
    }

    let key = limiter.key_for(&req);
    let decision = limiter.hit(&key);
    if !decision.allowed {
        metrics::denied("rate_limited");
        warn!(limiter = limiter.name(), key = %key, count = decision.count, "rate limit exceeded");
        return limiter.deny(&decision);
    }

    let mut response = next.run(req).await;
    decision.apply_headers(response.headers_mut());
    if limiter.options.skip_successful_requests && response.status().as_u16() < 400 {
        limiter.refund(&key, &decision);
    }
    response
}
