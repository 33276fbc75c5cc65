//! Analytics endpoints: tenant performance summary from orders and
//! portfolio snapshots.

use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::middleware::{AuthContext, RequestId};

pub async fn performance(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let orders = state
        .deps
        .orders()
        .list_for_tenant(&auth.tenant_id, 500)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
    let portfolio = state
        .deps
        .portfolio()
        .latest_state(&auth.tenant_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;

    let filled = orders.iter().filter(|o| o.status == "FILLED").count();
    let failed = orders
        .iter()
        .filter(|o| matches!(o.status.as_str(), "FAILED" | "REJECTED" | "TIMEOUT"))
        .count();
    let total_notional: f64 = orders
        .iter()
        .filter(|o| o.status == "FILLED")
        .map(|o| o.notional_usd)
        .sum();
    let total_fees: f64 = orders.iter().filter_map(|o| o.total_fees).sum();

    Ok(Json(json!({
        "orders_total": orders.len(),
        "orders_filled": filled,
        "orders_failed": failed,
        "fill_rate": if orders.is_empty() { 1.0 } else { filled as f64 / orders.len() as f64 },
        "traded_notional_usd": total_notional,
        "fees_usd": total_fees,
        "portfolio_value_usd": portfolio.total_value_usd,
        "cash_usd": portfolio.balances.get("USD").copied().unwrap_or(0.0),
        "open_positions": portfolio.positions.len(),
    })))
}
