//! HTTP API: shared state and router assembly.
//!
//! `build_router` returns the bare router so tests can drive it without
//! binding a socket; `main` attaches the listener. Ops endpoints stay
//! outside the auth layer so probes work unauthenticated.

pub mod analytics;
pub mod approvals;
pub mod chat;
pub mod confirmations;
pub mod error;
pub mod evals_api;
pub mod ops;
pub mod orders;
pub mod runs;
pub mod sse;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;

use crate::deps::Deps;
use crate::middleware::{
    auth_middleware, rate_limit_middleware, request_id_middleware, request_logging,
    RateLimitConfig, RateLimitLayer,
};
use sse::SseTracker;

#[derive(Clone)]
pub struct AppState {
    pub deps: Deps,
    pub sse: SseTracker,
    pub limiter: RateLimitLayer,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(deps: Deps, metrics: Option<PrometheusHandle>) -> Self {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: deps.settings.rate_limit_max_requests,
            window: std::time::Duration::from_secs(deps.settings.rate_limit_window_secs),
            ..Default::default()
        });
        Self {
            deps,
            sse: SseTracker::new(),
            limiter,
            metrics,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/chat/command", post(chat::chat_command))
        .route("/commands/execute", post(chat::execute_command))
        .route("/confirmations/:id/confirm", post(confirmations::confirm_trade))
        .route("/confirmations/:id/cancel", post(confirmations::cancel_trade))
        .route("/confirmations/:id/status", get(confirmations::confirmation_status))
        .route("/runs/trigger", post(runs::trigger_run))
        .route("/runs", get(runs::list_runs))
        .route("/runs/status/:id", get(runs::run_status))
        .route("/runs/:id", get(runs::run_detail))
        .route("/runs/:id/events", get(sse::stream_run_events))
        .route("/runs/:id/trace", get(runs::run_trace))
        .route("/debug/run_trace/:id", get(runs::run_trace))
        .route("/orders", get(orders::list_orders))
        .route("/orders/metrics/fill-latency", get(orders::fill_latency_metrics))
        .route("/orders/:id/reconcile", post(orders::reconcile_order))
        .route("/orders/:id/fill-status", get(orders::fill_status))
        .route("/approvals/:id/decision", post(approvals::decide_approval))
        .route("/evals/results", get(evals_api::eval_results))
        .route("/evals/summary", get(evals_api::eval_summary))
        .route("/analytics/performance", get(analytics::performance))
        .layer(from_fn_with_state(state.limiter.clone(), rate_limit_middleware))
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let public = Router::new()
        .route("/ops/health", get(ops::health))
        .route("/ops/metrics", get(ops::metrics));

    Router::new()
        .merge(authed)
        .merge(public)
        .layer(from_fn(request_logging))
        .layer(from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
