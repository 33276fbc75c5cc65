//! Rate limiting middleware.
//!
//! Sliding-window limiter keyed by `(tenant, user, path)` so one noisy
//! client cannot starve a tenant's other users or endpoints. Rejections
//! use the standard error envelope with `retry_after_seconds` and a
//! `Retry-After` header.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::middleware::auth::AuthContext;
use crate::middleware::request_id::RequestId;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window: Duration::from_secs(60),
            burst: 20,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<String, RateLimitEntry>>>,
}

struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

enum RateLimitResult {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn check(&self, key: &str) -> RateLimitResult {
        let mut state = self.state.lock();
        let now = Instant::now();
        let entry = state.entry(key.to_string()).or_insert(RateLimitEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        let limit = self.config.max_requests + self.config.burst;
        if entry.count > limit {
            let reset_at = entry.window_start + self.config.window;
            RateLimitResult::Exceeded {
                retry_after: reset_at.saturating_duration_since(now),
            }
        } else {
            RateLimitResult::Allowed
        }
    }

    /// Drop entries idle for two windows (call from a background task).
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let key = match request.extensions().get::<AuthContext>() {
        Some(auth) => format!("{}:{}:{}", auth.tenant_id, auth.user_id, path),
        None => format!("anon:{path}"),
    };
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    match limiter.check(&key) {
        RateLimitResult::Allowed => next.run(request).await,
        RateLimitResult::Exceeded { retry_after } => {
            warn!(key = %key, retry_after_secs = retry_after.as_secs(), "rate limit exceeded");
            let body = serde_json::json!({
                "error": {
                    "code": "RATE_LIMITED",
                    "message": "Too many requests. Please slow down.",
                    "request_id": request_id.clone(),
                },
                "request_id": request_id,
                "retry_after_seconds": retry_after.as_secs(),
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_under_limit() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 10,
            window: Duration::from_secs(60),
            burst: 0,
        });
        for _ in 0..10 {
            assert!(matches!(limiter.check("t:u:/runs"), RateLimitResult::Allowed));
        }
        assert!(matches!(
            limiter.check("t:u:/runs"),
            RateLimitResult::Exceeded { .. }
        ));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 0,
        });
        assert!(matches!(limiter.check("t:u:/a"), RateLimitResult::Allowed));
        assert!(matches!(
            limiter.check("t:u:/a"),
            RateLimitResult::Exceeded { .. }
        ));
        // A different path for the same user has its own window.
        assert!(matches!(limiter.check("t:u:/b"), RateLimitResult::Allowed));
    }

    #[test]
    fn test_cleanup_drops_idle_entries() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_millis(1),
            burst: 0,
        });
        limiter.check("t:u:/a");
        std::thread::sleep(Duration::from_millis(5));
        limiter.cleanup();
        assert!(limiter.state.lock().is_empty());
    }
}
