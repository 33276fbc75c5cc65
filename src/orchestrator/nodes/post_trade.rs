//! Post-trade node: reconcile fills for exchange-backed providers and
//! write the final portfolio snapshot.

use anyhow::Result;
use serde_json::json;
use tracing::warn;

use crate::deps::Deps;
use crate::orchestrator::nodes::{NodeCtx, NodeOutput};
use crate::providers::coinbase::CoinbaseProvider;
use crate::providers::BrokerProvider;

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let last_order = deps.orders().last_for_run(&ctx.run_id).await?;
    let mut fills_fetched = 0usize;

    if let Some(order) = &last_order {
        if order.provider == "COINBASE" {
            match CoinbaseProvider::new(deps.db.clone(), &deps.settings) {
                Ok(provider) => match provider.get_fills(&order.order_id).await {
                    Ok(fills) => fills_fetched = fills.len(),
                    Err(e) => {
                        warn!(run_id = %ctx.run_id, order_id = %order.order_id, error = %e, "fill fetch failed")
                    }
                },
                Err(e) => {
                    warn!(run_id = %ctx.run_id, error = %e, "live provider unavailable for fill reconciliation")
                }
            }
        }
    }

    // Final snapshot from the tenant ledger (snapshot 3 on the happy path).
    let state = deps.portfolio().latest_state(&ctx.tenant_id).await?;
    let snapshot_id = deps
        .portfolio()
        .insert_snapshot(Some(&ctx.run_id), &ctx.tenant_id, &state)
        .await?;

    let outputs = json!({
        "snapshot_id": snapshot_id,
        "order_id": last_order.as_ref().map(|o| o.order_id.clone()),
        "order_status": last_order.as_ref().map(|o| o.status.clone()),
        "fills_fetched": fills_fetched,
        "total_value_usd": state.total_value_usd,
    });
    Ok(NodeOutput::from_outputs(
        outputs,
        format!("Portfolio updated (total ${:.2})", state.total_value_usd),
    ))
}
