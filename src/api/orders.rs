//! Order endpoints: listing, reconciliation against the exchange, and
//! authoritative fill status.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::middleware::{AuthContext, RequestId};
use crate::models::is_terminal_order_status;
use crate::providers::coinbase::CoinbaseProvider;
use crate::providers::BrokerProvider;

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub run_id: Option<String>,
}

pub async fn list_orders(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let orders = match &query.run_id {
        Some(run_id) => state
            .deps
            .orders()
            .list_for_run(run_id)
            .await
            .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?
            .into_iter()
            .filter(|o| o.tenant_id == auth.tenant_id)
            .collect::<Vec<_>>(),
        None => state
            .deps
            .orders()
            .list_for_tenant(&auth.tenant_id, 50)
            .await
            .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?,
    };
    Ok(Json(json!(orders)))
}

/// Fill latency from FILLED order events, for dashboards.
pub async fn fill_latency_metrics(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let tenant = auth.tenant_id.clone();
    let metrics: Vec<Value> = state
        .deps
        .db
        .with_conn_retry(3, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT oe.ts, oe.payload_json FROM order_events oe
                 JOIN orders o ON oe.order_id = o.order_id
                 WHERE o.tenant_id = ?1 AND oe.event_type = 'FILLED'
                 ORDER BY oe.ts ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![tenant], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            Ok(rows)
        })
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?
        .into_iter()
        .filter_map(|(ts, payload)| {
            let payload: Value = serde_json::from_str(&payload).ok()?;
            Some(json!({
                "ts": ts,
                "latency_ms": payload.get("latency_ms").cloned().unwrap_or(json!(0)),
            }))
        })
        .collect();
    Ok(Json(json!(metrics)))
}

/// Check exchange status for a SUBMITTED order and update the local row.
pub async fn reconcile_order(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(order_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require_trader(request_id.as_str())?;
    let order = state
        .deps
        .orders()
        .get(&auth.tenant_id, &order_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?
        .ok_or_else(|| ApiError::not_found("Order not found", request_id.as_str()))?;

    if order.status != "SUBMITTED" {
        return Ok(Json(json!({
            "order_id": order_id,
            "status": order.status.clone(),
            "message": format!("Order already in state: {}", order.status),
            "reconciled": false,
        })));
    }
    if order.provider != "COINBASE" {
        return Ok(Json(json!({
            "order_id": order_id,
            "status": order.status,
            "message": format!("Reconciliation not supported for provider: {}", order.provider),
            "reconciled": false,
        })));
    }

    let provider = match CoinbaseProvider::new(state.deps.db.clone(), &state.deps.settings) {
        Ok(provider) => provider,
        Err(e) => {
            return Ok(Json(json!({
                "order_id": order_id,
                "status": order.status,
                "message": format!("Cannot reconcile: {e}"),
                "reconciled": false,
            })))
        }
    };

    match provider.get_fills(&order_id).await {
        Ok(fills) if !fills.is_empty() => {
            let mut total_qty = 0.0;
            let mut total_notional = 0.0;
            let mut total_fees = 0.0;
            for fill in &fills {
                let price = str_field(fill, "price");
                let size = str_field(fill, "size");
                total_qty += size;
                total_notional += price * size;
                total_fees += str_field(fill, "commission");
            }
            let avg = if total_qty > 0.0 { total_notional / total_qty } else { 0.0 };
            state
                .deps
                .orders()
                .update_status(
                    &order_id,
                    "FILLED",
                    Some("Reconciled from SUBMITTED"),
                    Some(total_qty),
                    Some(avg),
                    Some(total_fees),
                )
                .await
                .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
            info!(order_id = %order_id, "order reconciled SUBMITTED -> FILLED");
            Ok(Json(json!({
                "order_id": order_id,
                "status": "FILLED",
                "previous_status": "SUBMITTED",
                "message": "Order reconciled: SUBMITTED -> FILLED",
                "reconciled": true,
            })))
        }
        Ok(_) => Ok(Json(json!({
            "order_id": order_id,
            "status": order.status,
            "message": "Order status unchanged on exchange",
            "reconciled": false,
        }))),
        Err(e) => {
            warn!(order_id = %order_id, error = %e, "reconciliation failed");
            Ok(Json(json!({
                "order_id": order_id,
                "status": order.status,
                "message": format!("Reconciliation error: {e}"),
                "reconciled": false,
            })))
        }
    }
}

pub async fn fill_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(order_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let order = state
        .deps
        .orders()
        .get(&auth.tenant_id, &order_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?
        .ok_or_else(|| ApiError::not_found("Order not found", request_id.as_str()))?;

    let filled_qty = order.filled_qty.unwrap_or(0.0);
    let mut status = order.status.to_uppercase();
    let fill_confirmed = status == "FILLED";
    if !fill_confirmed
        && !is_terminal_order_status(&status)
        && filled_qty > 0.0
        && matches!(status.as_str(), "OPEN" | "PENDING_FILL" | "SUBMITTED")
    {
        status = "PARTIALLY_FILLED".to_string();
    }

    Ok(Json(json!({
        "order_id": order_id,
        "status": status,
        "filled_qty": filled_qty,
        "avg_fill_price": order.avg_fill_price.unwrap_or(0.0),
        "fill_confirmed": fill_confirmed,
        "status_reason": order.status_reason,
        "message": if fill_confirmed {
            "Order filled."
        } else {
            "Order submitted; fill not yet confirmed."
        },
    })))
}

fn str_field(value: &Value, key: &str) -> f64 {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}
