//! Ops endpoints: health (schema + config posture) and Prometheus export.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::api::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let schema = state.deps.db.schema_status().await;
    match schema {
        Ok(schema) => Json(json!({
            "status": if schema.schema_ok { "ok" } else { "degraded" },
            "database": schema.db_path,
            "schema_ok": schema.schema_ok,
            "applied_migrations": schema.applied_migrations,
            "pending_migrations": schema.pending_migrations,
            "missing_columns": schema.missing_columns,
            "config": {
                "trading_disable_live": state.deps.settings.trading_disable_live,
                "live_execution_allowed": state.deps.settings.enable_live_trading,
                "force_paper_mode": state.deps.settings.force_paper_mode,
                "kill_switch_enabled": state.deps.settings.kill_switch_enabled,
                "execution_mode_default": state.deps.settings.execution_mode_default.clone(),
                "execution_timeout_seconds": state.deps.settings.execution_timeout_seconds,
                "max_notional_per_order_usd": state.deps.settings.max_notional_per_order_usd,
                "max_trades_per_run": state.deps.settings.max_trades_per_run,
            },
        })),
        Err(e) => Json(json!({
            "status": "error",
            "database": state.deps.db.path().display().to_string(),
            "schema_ok": false,
            "error": e.to_string(),
        })),
    }
}

pub async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
