//! Confirmation gate endpoints: the single place where "the system wants
//! to trade X" becomes "the user approved X once".
//!
//! The atomic `PENDING -> CONFIRMED` update is the sole arbiter against
//! double execution; the losing side of a concurrent confirm returns the
//! winner's run id. The JSON response is fully built before the background
//! worker starts, so a failed response can never leave a stray execution.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::errors::TradeErrorCode;
use crate::middleware::{AuthContext, RequestId};
use crate::models::TradeIntent;
use crate::orchestrator::runner;

pub async fn confirm_trade(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(confirmation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require_trader(request_id.as_str())?;
    confirm_impl(&state, &auth.tenant_id, &auth.user_id, request_id.as_str(), &confirmation_id)
        .await
        .map(Json)
}

pub async fn confirm_impl(
    state: &AppState,
    tenant_id: &str,
    user_id: &str,
    request_id: &str,
    confirmation_id: &str,
) -> Result<Value, ApiError> {
    if !confirmation_id.starts_with("conf_") {
        warn!(tenant = tenant_id, conf = confirmation_id, "invalid confirmation id format");
        return Err(ApiError::bad_request(
            "INVALID_CONFIRMATION_ID",
            "invalid_confirmation_id_format",
            request_id,
        ));
    }

    let repo = state.deps.confirmations();
    let confirmation = repo
        .get(tenant_id, confirmation_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?
        .ok_or_else(|| ApiError::not_found("confirmation_not_found", request_id))?;

    // Idempotent: a non-PENDING confirmation reports its outcome and the
    // run it already created.
    if confirmation.status != "PENDING" {
        info!(tenant = tenant_id, conf = confirmation_id, status = %confirmation.status, "confirmation already processed");
        return Ok(json!({
            "status": confirmation.status.clone(),
            "message": format!("Confirmation is already {}", confirmation.status),
            "confirmation_id": confirmation_id,
            "run_id": confirmation.run_id,
            "already_confirmed": true,
        }));
    }

    if confirmation.is_expired_now() {
        let _ = repo.mark_expired(tenant_id, confirmation_id).await;
        info!(tenant = tenant_id, conf = confirmation_id, "confirmation expired");
        return Ok(json!({
            "status": "EXPIRED",
            "message": "Confirmation expired. Please submit a new trade request.",
            "confirmation_id": confirmation_id,
        }));
    }

    let proposal: Value =
        serde_json::from_str(&confirmation.proposal_json).unwrap_or_else(|_| json!({}));
    let mode = confirmation.mode.clone();

    // LIVE gate runs BEFORE mark_confirmed so a refusal leaves the
    // confirmation usable and no run behind.
    if mode == "LIVE" && state.deps.settings.trading_disable_live {
        warn!(conf = confirmation_id, tenant = tenant_id, "LIVE trade blocked by TRADING_DISABLE_LIVE");
        return Err(ApiError::forbidden(
            "LIVE_DISABLED",
            "LIVE trading is disabled. The trade was not executed.",
            request_id,
        )
        .with_remediation(TradeErrorCode::LiveDisabled.remediation().unwrap_or_default()));
    }

    let won = repo
        .mark_confirmed(tenant_id, confirmation_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    if !won {
        // Another request confirmed concurrently; surface its run.
        let reloaded = repo
            .get(tenant_id, confirmation_id)
            .await
            .map_err(|e| ApiError::from_internal(e, request_id))?;
        let existing_run_id = reloaded.as_ref().and_then(|c| c.run_id.clone());
        if let Some(run_id) = &existing_run_id {
            if let Ok(Some(run)) = state.deps.runs().get(run_id).await {
                if run.status == "RUNNING" {
                    return Ok(json!({
                        "status": "EXECUTING",
                        "message": "Trade is already executing",
                        "confirmation_id": confirmation_id,
                        "run_id": run_id,
                    }));
                }
            }
        }
        return Ok(json!({
            "status": reloaded.map(|c| c.status).unwrap_or_else(|| "CONFIRMED".to_string()),
            "message": "Confirmation already processed",
            "confirmation_id": confirmation_id,
            "run_id": existing_run_id,
            "already_confirmed": true,
        }));
    }

    // One active run per conversation (tenant-wide when unknown).
    let conversation_id = confirmation.conversation_id.clone();
    if let Some(active_run) = state
        .deps
        .runs()
        .find_active(tenant_id, conversation_id.as_deref())
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?
    {
        warn!(
            tenant = tenant_id,
            conversation = ?conversation_id,
            active_run = %active_run,
            conf = confirmation_id,
            "active run guard blocked new run"
        );
        return Err(ApiError::conflict(
            "RUN_ALREADY_ACTIVE",
            "A trade is currently executing. Wait for it to complete.",
            request_id,
        ));
    }

    let side = proposal.get("side").and_then(|s| s.as_str()).unwrap_or("buy").to_uppercase();
    let asset = proposal.get("asset").and_then(|a| a.as_str()).unwrap_or("BTC").to_string();
    let amount_usd = proposal.get("amount_usd").and_then(|a| a.as_f64()).unwrap_or(10.0);
    let lookback_hours = proposal.get("lookback_hours").and_then(|l| l.as_i64()).unwrap_or(24);
    let is_most_profitable = proposal
        .get("is_most_profitable")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let news_enabled = proposal.get("news_enabled").and_then(|v| v.as_bool()).unwrap_or(true);
    let asset_class = proposal
        .get("asset_class")
        .and_then(|a| a.as_str())
        .unwrap_or("CRYPTO")
        .to_string();
    let selection_result = proposal.get("selection_result").cloned().filter(|v| !v.is_null());

    // Decision lock: immutable once the run is created. Either the chat
    // layer pre-computed it (auto-selection) or a direct asset implies it.
    let mut locked_product_id = proposal
        .get("locked_product_id")
        .and_then(|l| l.as_str())
        .map(String::from);
    let (universe, display_asset) = if let Some(selected) = selection_result
        .as_ref()
        .and_then(|s| s.get("selected_symbol").and_then(|v| v.as_str()))
    {
        let product_id = format!("{selected}-USD");
        locked_product_id = Some(product_id.clone());
        (vec![product_id], format!("{selected} (top performer)"))
    } else if is_most_profitable || asset == "AUTO" {
        warn!(conf = confirmation_id, "no pre-selected asset for most-profitable command, research will rank the universe");
        (vec!["AUTO".to_string()], "most profitable crypto".to_string())
    } else {
        let product_id = format!("{asset}-USD");
        locked_product_id = Some(product_id.clone());
        (vec![product_id], asset.clone())
    };

    let window = match lookback_hours {
        h if h <= 1 => "1h".to_string(),
        h if h <= 24 => "24h".to_string(),
        h if h <= 168 => format!("{h}h"),
        _ => "7d".to_string(),
    };
    let raw_command = format!("Confirmed {mode} trade: {side} ${amount_usd} of {display_asset}");
    let intent = TradeIntent {
        side: side.clone(),
        budget_usd: amount_usd,
        metric: "return".to_string(),
        window,
        lookback_hours,
        universe: universe.clone(),
        raw_command: raw_command.clone(),
        constraints: json!({}),
    };

    let run_id = runner::create_run(&state.deps, tenant_id, &mode, None, conversation_id.as_deref())
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    repo.set_run_id(tenant_id, confirmation_id, &run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;

    let mut execution_plan = json!({});
    if !is_most_profitable && asset != "AUTO" {
        let symbol = format!("{asset}-USD");
        execution_plan["selected_asset"] = json!(symbol);
        execution_plan["selected_order"] = json!({
            "symbol": symbol,
            "side": side,
            "notional_usd": amount_usd,
        });
    }

    let metadata = json!({
        "intent": "TRADE_EXECUTION",
        "confirmed": true,
        "side": side.clone(),
        "asset": asset.clone(),
        "amount_usd": amount_usd,
        "mode": mode.clone(),
        "confirmation_id": confirmation_id,
        "is_most_profitable": is_most_profitable,
        "lookback_hours": lookback_hours,
        "universe": universe,
        "locked_product_id": locked_product_id.clone(),
        "selection_basis": selection_result.as_ref().map(|s| json!({
            "criteria": s.get("why_explanation").cloned(),
            "return_pct": s.get("selected_return_pct").cloned(),
            "window": s.get("window_description").cloned(),
        })),
    });

    state
        .deps
        .runs()
        .set_trade_fields(
            &run_id,
            &raw_command,
            &metadata.to_string(),
            &serde_json::to_string(&intent).unwrap_or_default(),
            &execution_plan.to_string(),
            news_enabled,
            &asset_class,
            locked_product_id.as_deref(),
            conversation_id.as_deref(),
        )
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;

    info!(
        run_id = %run_id,
        mode = %mode,
        asset = %asset,
        side = %side,
        amount_usd,
        tenant = tenant_id,
        conf = confirmation_id,
        user = user_id,
        locked = ?locked_product_id,
        "trade execution starting"
    );

    // Two-phase: the response object is complete before any work starts.
    let mut response = json!({
        "run_id": run_id.clone(),
        "status": "EXECUTING",
        "executed": true,
        "order_status": "submitted",
        "confirmation_id": confirmation_id,
        "intent": "TRADE_EXECUTION",
        "execution_mode": mode.clone(),
        "news_enabled": news_enabled,
        "content": format!("{mode} trade confirmed. Executing {side} ${amount_usd} of {display_asset}..."),
    });
    if let Some(insight_raw) = &confirmation.insight_json {
        if let Ok(insight) = serde_json::from_str::<Value>(insight_raw) {
            response["financial_insight"] = insight;
        }
    }

    runner::spawn_run_worker(state.deps.clone(), run_id);
    Ok(response)
}

pub async fn cancel_trade(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(confirmation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require_trader(request_id.as_str())?;
    let repo = state.deps.confirmations();
    let confirmation = repo
        .get(&auth.tenant_id, &confirmation_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?
        .ok_or_else(|| ApiError::not_found("confirmation_not_found", request_id.as_str()))?;

    if confirmation.status != "PENDING" {
        return Ok(Json(json!({
            "status": confirmation.status.clone(),
            "message": format!("Confirmation is already {}", confirmation.status),
            "confirmation_id": confirmation_id,
            "run_id": confirmation.run_id,
        })));
    }

    repo.mark_cancelled(&auth.tenant_id, &confirmation_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
    info!(conf = %confirmation_id, tenant = %auth.tenant_id, "confirmation cancelled");
    Ok(Json(json!({
        "status": "CANCELLED",
        "message": "Trade cancelled",
        "confirmation_id": confirmation_id,
    })))
}

/// Authoritative recovery endpoint for clients that lost the confirm
/// response.
pub async fn confirmation_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(confirmation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let confirmation = state
        .deps
        .confirmations()
        .get(&auth.tenant_id, &confirmation_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?
        .ok_or_else(|| ApiError::not_found("confirmation_not_found", request_id.as_str()))?;

    let mut executed = confirmation.status == "CONFIRMED";
    let mut order_status = "not_submitted".to_string();
    let mut order_id = None;

    if let Some(run_id) = &confirmation.run_id {
        let run_status = state
            .deps
            .runs()
            .get(run_id)
            .await
            .ok()
            .flatten()
            .map(|r| r.status)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        if let Ok(Some(order)) = state.deps.orders().last_for_run(run_id).await {
            order_id = Some(order.order_id);
            order_status = order.status.to_lowercase();
        } else if run_status == "COMPLETED" || run_status == "RUNNING" {
            order_status = "submitted".to_string();
        } else if run_status == "FAILED" {
            order_status = "failed".to_string();
            executed = false;
        }
    }

    Ok(Json(json!({
        "confirmation_id": confirmation_id,
        "status": confirmation.status,
        "executed": executed,
        "order_id": order_id,
        "order_status": order_status,
        "run_id": confirmation.run_id,
        "request_id": request_id.as_str(),
    })))
}
