//! SSE gateway: per-user connection tracking and the run event stream.
//!
//! A subscriber first receives every historical event in `ts` order, then
//! live events until the run turns terminal, then a synthetic
//! `RUN_COMPLETE` before the stream closes. Idle streams heartbeat every
//! second. Each user may hold at most 3 concurrent connections; stale
//! entries (idle > 5 min) are pruned before the cap is enforced.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Extension,
};
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::ids::new_id;
use crate::middleware::{AuthContext, RequestId};

pub const MAX_SSE_CONNECTIONS_PER_USER: usize = 3;
pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Tracks `user_key -> {connection_id -> (run_id, last_seen)}`.
#[derive(Clone, Default)]
pub struct SseTracker {
    connections: Arc<Mutex<HashMap<String, HashMap<String, (String, Instant)>>>>,
}

impl SseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, pruning stale ones first. Returns false when
    /// the user is at the cap.
    pub fn track(&self, user_key: &str, connection_id: &str, run_id: &str) -> bool {
        let mut map = self.connections.lock();
        let entry = map.entry(user_key.to_string()).or_default();
        let now = Instant::now();
        entry.retain(|_, (_, seen)| now.duration_since(*seen) <= SSE_IDLE_TIMEOUT);
        if entry.len() >= MAX_SSE_CONNECTIONS_PER_USER {
            warn!(user_key, count = entry.len(), "SSE connection limit exceeded");
            return false;
        }
        entry.insert(connection_id.to_string(), (run_id.to_string(), now));
        true
    }

    pub fn untrack(&self, user_key: &str, connection_id: &str) {
        let mut map = self.connections.lock();
        if let Some(entry) = map.get_mut(user_key) {
            entry.remove(connection_id);
            if entry.is_empty() {
                map.remove(user_key);
            }
        }
    }

    pub fn count(&self, user_key: &str) -> usize {
        self.connections.lock().get(user_key).map(|e| e.len()).unwrap_or(0)
    }
}

/// `GET /runs/{run_id}/events`
pub async fn stream_run_events(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let user_key = auth.user_key();
    let connection_id = new_id("sse_");

    if !state.sse.track(&user_key, &connection_id, &run_id) {
        crate::telemetry::record_sse_connection_rejected();
        return Err(ApiError::new(
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            "SSE_LIMIT",
            format!(
                "Maximum concurrent SSE connections ({MAX_SSE_CONNECTIONS_PER_USER}) exceeded. Close existing connections and try again."
            ),
            request_id.as_str(),
        ));
    }

    let run = state
        .deps
        .runs()
        .get_scoped(&auth.tenant_id, &run_id)
        .await
        .map_err(|e| {
            state.sse.untrack(&user_key, &connection_id);
            ApiError::from_internal(e, request_id.as_str())
        })?;
    if run.is_none() {
        state.sse.untrack(&user_key, &connection_id);
        return Err(ApiError::not_found("Run not found", request_id.as_str()));
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);
    let deps = state.deps.clone();
    let sse = state.sse.clone();
    let stream_run_id = run_id.clone();

    tokio::spawn(async move {
        // Subscribe before replaying history so no live event is lost in
        // the gap; duplicates are preferable to holes.
        let mut subscription = deps.bus.subscribe(&stream_run_id);

        match deps.events().list_for_run(&stream_run_id).await {
            Ok(historical) => {
                for row in historical {
                    let payload: serde_json::Value =
                        serde_json::from_str(&row.payload_json).unwrap_or(serde_json::Value::Null);
                    let data = serde_json::json!({
                        "event_type": row.event_type,
                        "payload": payload,
                        "ts": row.ts,
                    });
                    if tx.send(Ok(Event::default().data(data.to_string()))).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => warn!(run_id = %stream_run_id, error = %e, "failed to replay historical events"),
        }

        loop {
            // Terminal check first so a finished run closes promptly.
            let status = deps
                .runs()
                .get(&stream_run_id)
                .await
                .ok()
                .flatten()
                .map(|r| r.status);
            if let Some(status) = &status {
                if status == "COMPLETED" || status == "FAILED" {
                    let close = serde_json::json!({
                        "event_type": "RUN_COMPLETE",
                        "status": status,
                    });
                    let _ = tx.send(Ok(Event::default().data(close.to_string()))).await;
                    break;
                }
            }

            tokio::select! {
                received = subscription.rx.recv() => {
                    match received {
                        Some(envelope) => {
                            let data = serde_json::to_string(&envelope).unwrap_or_default();
                            if tx.send(Ok(Event::default().data(data))).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    if tx.send(Ok(Event::default().comment("heartbeat"))).await.is_err() {
                        break;
                    }
                }
            }
        }

        sse.untrack(&user_key, &connection_id);
        deps.bus.unsubscribe(&stream_run_id, &subscription.id);
        debug!(run_id = %stream_run_id, "SSE stream closed");
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_caps_connections() {
        let tracker = SseTracker::new();
        assert!(tracker.track("t:u", "c1", "run_1"));
        assert!(tracker.track("t:u", "c2", "run_1"));
        assert!(tracker.track("t:u", "c3", "run_1"));
        assert!(!tracker.track("t:u", "c4", "run_1"));
        assert_eq!(tracker.count("t:u"), 3);
        // A different user is unaffected.
        assert!(tracker.track("t:v", "c1", "run_1"));
    }

    #[test]
    fn test_untrack_frees_slot() {
        let tracker = SseTracker::new();
        for i in 0..3 {
            assert!(tracker.track("t:u", &format!("c{i}"), "run_1"));
        }
        tracker.untrack("t:u", "c0");
        assert_eq!(tracker.count("t:u"), 2);
        assert!(tracker.track("t:u", "c9", "run_1"));
    }
}
