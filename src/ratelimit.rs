use crate::models::{ApiEnvelope, ApiErrorBody};
use crate::security::request_id_of;
use crate::store::KvStore;
use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header::HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tokio::time::Duration;
use tracing::warn;

pub const GLOBAL_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const GLOBAL_LIMIT: u64 = 1000;
pub const API_WINDOW: Duration = Duration::from_secs(60);
pub const API_LIMIT: u64 = 60;

static HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub scope: &'static str,
    pub window: Duration,
    pub limit: u64,
}

impl RatePolicy {
    pub const fn global() -> Self {
        Self {
            scope: "global",
            window: GLOBAL_WINDOW,
            limit: GLOBAL_LIMIT,
        }
    }

    pub const fn api() -> Self {
        Self {
            scope: "api",
            window: API_WINDOW,
            limit: API_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_secs: u64,
}

/// Fixed-window counter on top of the key/value tier. The window is derived
/// from wall-clock time, so every instance sharing the backend agrees on the
/// bucket without coordination. A backend failure produces an allow decision
/// with a full window remaining: limiting is best-effort, availability wins.
#[derive(Clone)]
pub struct RateLimiter {
    kv: KvStore,
}

impl RateLimiter {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub async fn check(&self, policy: RatePolicy, key: &str) -> RateDecision {
        let now_secs = chrono::Utc::now().timestamp() as u64;
        let window_secs = policy.window.as_secs().max(1);
        let bucket = now_secs / window_secs;
        let reset_at_secs = (bucket + 1) * window_secs;
        let counter_key = format!("rl:{}:{key}:{bucket}", policy.scope);

        match self.kv.incr_with_ttl(&counter_key, policy.window).await {
            Some(count) => RateDecision {
                allowed: count <= policy.limit,
                limit: policy.limit,
                remaining: policy.limit.saturating_sub(count),
                reset_at_secs,
            },
            None => {
                warn!(target: "dropflow.ratelimit", scope = policy.scope, "counter unavailable, failing open");
                RateDecision {
                    allowed: true,
                    limit: policy.limit,
                    remaining: policy.limit,
                    reset_at_secs,
                }
            }
        }
    }
}

fn client_ip(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    forwarded
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn apply_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    headers.insert(HEADER_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(HEADER_REMAINING.clone(), HeaderValue::from(decision.remaining));
    headers.insert(HEADER_RESET.clone(), HeaderValue::from(decision.reset_at_secs));
}

fn rejected(decision: &RateDecision, request_id: String) -> Response {
    let retry_after = decision
        .reset_at_secs
        .saturating_sub(chrono::Utc::now().timestamp() as u64)
        .max(1);
    let body = ApiEnvelope::<()>::err(
        ApiErrorBody::new("RATE_LIMITED", "too many requests")
            .with_details(json!({ "retryAfterSecs": retry_after })),
        request_id,
    );
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_headers(&mut response, decision);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert("retry-after", value);
    }
    response
}

/// Per-IP limiter across the whole surface: 1000 requests per 15 minutes.
pub async fn global_rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_ip(&request);
    let decision = limiter.check(RatePolicy::global(), &key).await;
    if !decision.allowed {
        return rejected(&decision, request_id_of(&request));
    }
    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}

/// Per-IP-per-route limiter for the API surface: 60 requests per minute.
pub async fn api_rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let key = format!("{}:{}", client_ip(&request), request.uri().path());
    let decision = limiter.check(RatePolicy::api(), &key).await;
    if !decision.allowed {
        return rejected(&decision, request_id_of(&request));
    }
    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}
