//! API-key authentication and per-org rate limiting for the protected routes.
//! Keys come from `ARGUS_API_KEYS` as comma-separated `org:key` pairs; each
//! org draws from its own token bucket. Rate headers are attached to every
//! authenticated response, allowed or not.

use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, KeyIdentity>>,
    limiter: RateLimiter,
}

/// Attached to the request extensions for handlers to log against.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub org_id: String,
    pub api_key_id: String,
}

#[derive(Clone, Debug)]
struct KeyIdentity {
    org_id: String,
    key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("ARGUS_API_KEYS").unwrap_or_else(|_| "demo-org:demo-key".to_string());
        Self::from_key_spec(&raw, RateLimiter::from_env())
    }

    fn from_key_spec(spec: &str, limiter: RateLimiter) -> Self {
        let mut keys = HashMap::new();
        for (idx, pair) in spec.split(',').map(str::trim).enumerate() {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once(':') {
                Some((org, secret)) if !org.trim().is_empty() && !secret.trim().is_empty() => {
                    keys.insert(
                        secret.trim().to_string(),
                        KeyIdentity {
                            org_id: org.trim().to_string(),
                            key_id: format!("key-{:02}", idx + 1),
                        },
                    );
                }
                _ => warn!(
                    target = "argus.api",
                    entry = pair,
                    "ignored malformed ARGUS_API_KEYS entry"
                ),
            }
        }
        if keys.is_empty() {
            warn!(
                target = "argus.api",
                "no usable API keys configured; falling back to demo credentials"
            );
            keys.insert(
                "demo-key".to_string(),
                KeyIdentity {
                    org_id: "demo-org".to_string(),
                    key_id: "key-01".to_string(),
                },
            );
        } else {
            info!(target = "argus.api", key_count = keys.len(), "API keys loaded");
        }
        Self {
            keys: Arc::new(keys),
            limiter,
        }
    }

    fn identify(&self, presented: &str) -> Option<AuthContext> {
        self.keys.get(presented).map(|identity| AuthContext {
            org_id: identity.org_id.clone(),
            api_key_id: identity.key_id.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = presented_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Argus-Key or a Bearer token",
        ));
    };
    let Some(context) = state.identify(&presented) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    let decision = state.limiter.check(&context.org_id).await;
    if !decision.allowed {
        let mut response =
            error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many requests");
        decision.write_headers(response.headers_mut());
        return Ok(response);
    }

    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    decision.write_headers(response.headers_mut());
    Ok(response)
}

fn presented_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() > 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        let token = raw[6..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    headers
        .get("X-Argus-Key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// Token bucket per org: `capacity` burst, refilled at `rate_per_sec`.
#[derive(Clone)]
struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Outcome of a single bucket draw, also the source for rate headers.
#[derive(Debug, Clone, Copy)]
struct RateDecision {
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_secs: u64,
    retry_after_secs: u64,
}

impl RateLimiter {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity)
    }

    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn check(&self, org_id: &str) -> RateDecision {
        let now = Instant::now();
        let mut guard = self.buckets.lock().await;
        let bucket = guard.entry(org_id.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            refilled_at: now,
        });

        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.refilled_at = now;

        let allowed = bucket.tokens >= 1.0;
        let retry_after_secs = if allowed {
            bucket.tokens -= 1.0;
            0
        } else {
            ((1.0 - bucket.tokens) / self.rate_per_sec).ceil().max(1.0) as u64
        };
        RateDecision {
            allowed,
            limit: self.capacity as u64,
            remaining: bucket.tokens.max(0.0).floor() as u64,
            reset_secs: ((self.capacity - bucket.tokens) / self.rate_per_sec)
                .ceil()
                .max(0.0) as u64,
            retry_after_secs,
        }
    }
}

impl RateDecision {
    fn write_headers(&self, headers: &mut http::HeaderMap) {
        let set = |headers: &mut http::HeaderMap, name: &'static str, value: u64| {
            if let Ok(header) = HeaderValue::from_str(&value.to_string()) {
                headers.insert(name, header);
            }
        };
        set(headers, "X-RateLimit-Limit", self.limit);
        set(headers, "X-RateLimit-Remaining", self.remaining);
        set(headers, "X-RateLimit-Reset", self.reset_secs);
        if !self.allowed {
            set(headers, "retry-after", self.retry_after_secs);
        }
    }
}
