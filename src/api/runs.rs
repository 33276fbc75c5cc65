//! Run endpoints: trigger, listing, detail, poll status, and trace.

use axum::{
    extract::{Path, State},
    http::HeaderValue,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::middleware::{AuthContext, RequestId};
use crate::orchestrator::runner;

const STALE_ORDER_AGE_SECONDS: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct RunTrigger {
    #[serde(default = "default_mode")]
    pub execution_mode: String,
    pub source_run_id: Option<String>,
}

fn default_mode() -> String {
    "PAPER".to_string()
}

pub async fn trigger_run(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Json(trigger): Json<RunTrigger>,
) -> Result<Response, ApiError> {
    auth.require_trader(request_id.as_str())?;
    let request_id = request_id.as_str();
    let mode = trigger.execution_mode.to_uppercase();
    if !matches!(mode.as_str(), "PAPER" | "LIVE" | "REPLAY") {
        return Err(ApiError::bad_request(
            "INVALID_EXECUTION_MODE",
            format!("Unsupported execution mode {mode}"),
            request_id,
        ));
    }
    if mode == "REPLAY" && trigger.source_run_id.is_none() {
        return Err(ApiError::bad_request(
            "MISSING_SOURCE_RUN",
            "source_run_id is required when execution_mode is REPLAY",
            request_id,
        ));
    }
    if mode != "REPLAY" && trigger.source_run_id.is_some() {
        return Err(ApiError::bad_request(
            "UNEXPECTED_SOURCE_RUN",
            "source_run_id is only valid when execution_mode is REPLAY",
            request_id,
        ));
    }
    if let Some(source) = &trigger.source_run_id {
        let exists = state
            .deps
            .runs()
            .get_scoped(&auth.tenant_id, source)
            .await
            .map_err(|e| ApiError::from_internal(e, request_id))?;
        if exists.is_none() {
            return Err(ApiError::not_found(
                format!("Source run {source} not found"),
                request_id,
            ));
        }
    }

    let run_id = runner::create_run(
        &state.deps,
        &auth.tenant_id,
        &mode,
        trigger.source_run_id.as_deref(),
        None,
    )
    .await
    .map_err(|e| ApiError::from_internal(e, request_id))?;
    runner::spawn_run_worker(state.deps.clone(), run_id.clone());

    let run = state
        .deps
        .runs()
        .get(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?
        .ok_or_else(|| ApiError::internal(request_id))?;
    let trace_id = run.trace_id.clone();
    let mut response = Json(json!({
        "run_id": run.run_id,
        "tenant_id": run.tenant_id,
        "status": run.status,
        "execution_mode": run.execution_mode,
        "created_at": run.created_at,
        "trace_id": run.trace_id,
        "source_run_id": run.source_run_id,
    }))
    .into_response();
    attach_trace_header(&mut response, trace_id);
    Ok(response)
}

pub async fn list_runs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let runs = state
        .deps
        .runs()
        .list(&auth.tenant_id, 50)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
    let rows: Vec<Value> = runs
        .into_iter()
        .map(|r| {
            json!({
                "run_id": r.run_id,
                "tenant_id": r.tenant_id,
                "status": r.status,
                "execution_mode": r.execution_mode,
                "created_at": r.created_at,
                "trace_id": r.trace_id,
            })
        })
        .collect();
    Ok(Json(json!(rows)))
}

/// Minimal status for frequent polling, including progress counters and
/// stale SUBMITTED orders needing reconciliation.
pub async fn run_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let request_id = request_id.as_str();
    let run = state
        .deps
        .runs()
        .get_scoped(&auth.tenant_id, &run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?
        .ok_or_else(|| ApiError::not_found("Run not found", request_id))?;

    let nodes = state.deps.nodes();
    let current_step = nodes.current_step(&run_id).await.unwrap_or(None);
    let (total_steps, completed_steps) = nodes.counts(&run_id).await.unwrap_or((0, 0));
    let last_error = nodes.last_error(&run_id).await.unwrap_or(None);
    let updated_at = state.deps.events().last_ts(&run_id).await.unwrap_or(None);
    let stale_order_ids = if total_steps > 0 {
        state
            .deps
            .orders()
            .stale_submitted(&run_id, STALE_ORDER_AGE_SECONDS)
            .await
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    Ok(Json(json!({
        "run_id": run.run_id,
        "status": run.status,
        "execution_mode": run.execution_mode,
        "started_at": run.started_at,
        "completed_at": run.completed_at,
        "current_step": current_step,
        "total_steps": total_steps,
        "completed_steps": completed_steps,
        "last_error": last_error,
        "updated_at": updated_at,
        "stale_order_ids": stale_order_ids,
    })))
}

/// Full run detail: run + nodes + policy events + approvals + orders +
/// snapshots + fills + evals.
pub async fn run_detail(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let request_id = request_id.as_str();
    let run = state
        .deps
        .runs()
        .get_scoped(&auth.tenant_id, &run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?
        .ok_or_else(|| ApiError::not_found("Run not found", request_id))?;

    let nodes = state
        .deps
        .nodes()
        .list(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let policy_events = load_policy_events(&state, &run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let approvals = state
        .deps
        .approvals()
        .list_for_run(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let orders = state
        .deps
        .orders()
        .list_for_run(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let snapshots = state
        .deps
        .portfolio()
        .list_for_run(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let fills = state
        .deps
        .orders()
        .list_fills_for_run(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let evals = state
        .deps
        .evals()
        .list_for_run(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let artifacts = state
        .deps
        .artifacts()
        .list(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let last_event_at = state.deps.events().last_ts(&run_id).await.unwrap_or(None);

    let summary_text = run.metadata_json.as_deref().and_then(summary_from_metadata);
    let trace_id = run.trace_id.clone();
    let mut run_value = serde_json::to_value(&run).unwrap_or(Value::Null);
    run_value["summary_text"] = json!(summary_text);
    run_value["last_event_at"] = json!(last_event_at);
    run_value["artifacts_count"] = json!(artifacts.len());

    let mut response = Json(json!({
        "run": run_value,
        "nodes": nodes,
        "policy_events": policy_events,
        "approvals": approvals,
        "orders": orders,
        "snapshots": snapshots,
        "fills": fills,
        "evals": evals,
        "artifacts": artifacts,
    }))
    .into_response();
    attach_trace_header(&mut response, trace_id);
    Ok(response)
}

/// Full decision trace for debugging: events, nodes, and tool calls.
pub async fn run_trace(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let request_id = request_id.as_str();
    let run = state
        .deps
        .runs()
        .get_scoped(&auth.tenant_id, &run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?
        .ok_or_else(|| ApiError::not_found("Run not found", request_id))?;

    let events = state
        .deps
        .events()
        .list_for_run(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let nodes = state
        .deps
        .nodes()
        .list(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    let tool_calls = state
        .deps
        .evidence()
        .list_tool_calls(&run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;

    Ok(Json(json!({
        "run_id": run.run_id,
        "trace_id": run.trace_id,
        "status": run.status,
        "events": events,
        "nodes": nodes,
        "tool_calls": tool_calls,
    })))
}

async fn load_policy_events(state: &AppState, run_id: &str) -> anyhow::Result<Vec<Value>> {
    let run = run_id.to_string();
    state
        .deps
        .db
        .with_conn_retry(3, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, node_id, decision, reasons_json, ts FROM policy_events
                 WHERE run_id = ?1 ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![run], |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "node_id": r.get::<_, Option<String>>(1)?,
                        "decision": r.get::<_, String>(2)?,
                        "reasons_json": r.get::<_, String>(3)?,
                        "ts": r.get::<_, String>(4)?,
                    }))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .await
}

fn summary_from_metadata(raw: &str) -> Option<String> {
    let metadata: Value = serde_json::from_str(raw).ok()?;
    match metadata.get("intent").and_then(|i| i.as_str()) {
        Some("PORTFOLIO_ANALYSIS") => Some("Portfolio analysis completed".to_string()),
        Some("TRADE_EXECUTION") => {
            let side = metadata.get("side").and_then(|s| s.as_str()).unwrap_or("");
            let asset = metadata.get("asset").and_then(|a| a.as_str()).unwrap_or("");
            let amount = metadata.get("amount_usd").and_then(|a| a.as_f64()).unwrap_or(0.0);
            Some(format!("{side} ${amount} of {asset}"))
        }
        _ => None,
    }
}

fn attach_trace_header(response: &mut Response, trace_id: Option<String>) {
    if let Some(trace_id) = trace_id {
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("X-Trace-ID", value);
        }
    }
}
