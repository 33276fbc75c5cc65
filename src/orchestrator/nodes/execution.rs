//! Execution node: place the proposed order through the provider selected
//! by the run's execution mode.
//!
//! The locked product id always wins over the proposal's symbol. A policy
//! BLOCKED decision or a blocked (empty-orders) proposal fails the run
//! here so the terminal receipt records the block. ASSISTED_LIVE produces
//! an order ticket and skips submission.

use anyhow::Result;
use serde_json::json;
use tracing::warn;

use crate::deps::Deps;
use crate::errors::{TradeError, TradeErrorCode};
use crate::ids::{new_id, now_iso};
use crate::orchestrator::nodes::{NodeCtx, NodeOutput};
use crate::providers::coinbase::CoinbaseProvider;
use crate::providers::paper::PaperProvider;
use crate::providers::replay::ReplayProvider;
use crate::providers::BrokerProvider;

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let run = deps
        .runs()
        .get(&ctx.run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run {} not found", ctx.run_id))?;
    let proposal: serde_json::Value = run
        .trade_proposal_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .ok_or_else(|| anyhow::anyhow!("no proposal found for run {}", ctx.run_id))?;

    let policy = deps.nodes().outputs(&ctx.run_id, "policy_check").await?;
    let policy_decision = policy
        .as_ref()
        .and_then(|p| p.get("decision").and_then(|d| d.as_str()))
        .unwrap_or("ALLOWED")
        .to_string();
    if policy_decision == "BLOCKED" {
        let reasons = policy
            .as_ref()
            .and_then(|p| p.get("reasons").cloned())
            .unwrap_or(json!([]));
        return Err(TradeError::new(
            TradeErrorCode::PolicyBlocked,
            format!("policy blocked the proposal: {reasons}"),
        )
        .into());
    }

    let orders = proposal
        .get("orders")
        .and_then(|o| o.as_array())
        .cloned()
        .unwrap_or_default();
    let Some(order) = orders.first() else {
        let rationale = proposal
            .get("rationale")
            .and_then(|r| r.as_str())
            .unwrap_or("proposal contains no orders");
        return Err(TradeError::new(TradeErrorCode::ProposalBlocked, rationale).into());
    };

    let proposed_symbol = order
        .get("symbol")
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_string();
    let side = order.get("side").and_then(|s| s.as_str()).unwrap_or("BUY");
    let notional_usd = order
        .get("notional_usd")
        .and_then(|n| n.as_f64())
        .unwrap_or(0.0);

    // The decision lock is immutable: never trade a re-ranked symbol.
    let product_id = match &run.locked_product_id {
        Some(locked) => {
            let normalized = normalize_product_id(&proposed_symbol);
            if normalized != *locked {
                warn!(
                    run_id = %ctx.run_id,
                    proposed = %normalized,
                    locked = %locked,
                    "execution overriding proposal symbol with locked product id"
                );
            }
            locked.clone()
        }
        None => normalize_product_id(&proposed_symbol),
    };

    let order_mode = order
        .get("execution_mode")
        .and_then(|m| m.as_str())
        .unwrap_or(&run.execution_mode);
    if order_mode == "ASSISTED_LIVE" || run.execution_mode == "ASSISTED_LIVE" {
        return assisted_live_ticket(deps, ctx, &product_id, side, notional_usd).await;
    }

    let provider: Box<dyn BrokerProvider> = match run.execution_mode.as_str() {
        "PAPER" => Box::new(PaperProvider::new(deps.db.clone(), deps.market.clone())),
        "LIVE" => Box::new(CoinbaseProvider::new(deps.db.clone(), &deps.settings)?),
        "REPLAY" => {
            let source = run.source_run_id.as_deref().ok_or_else(|| {
                anyhow::anyhow!("REPLAY run {} has no source_run_id", ctx.run_id)
            })?;
            Box::new(ReplayProvider::new(deps.db.clone(), source))
        }
        other => anyhow::bail!("unsupported execution mode {other}"),
    };

    let qty = if side.to_uppercase() == "SELL" {
        // SELL sizes by base: derive from the latest known price.
        match run.execution_mode.as_str() {
            "REPLAY" => None,
            _ => {
                let price = deps.market.get_price(&product_id).await?;
                Some(notional_usd / price)
            }
        }
    } else {
        None
    };

    let order_id = provider
        .place_order(&ctx.run_id, &ctx.tenant_id, &product_id, side, notional_usd, qty)
        .await?;

    deps.artifacts()
        .insert(
            &ctx.run_id,
            "execution",
            "order_response",
            &json!({
                "order_id": order_id.clone(),
                "provider": provider.name(),
                "symbol": product_id.clone(),
                "side": side,
                "notional_usd": notional_usd,
                "placed_at": now_iso(),
            }),
        )
        .await?;

    let summary = format!(
        "Placed {side} ${notional_usd:.2} {product_id} via {}",
        provider.name()
    );
    let outputs = json!({
        "order_id": order_id,
        "provider": provider.name(),
        "symbol": product_id,
        "side": side,
        "notional_usd": notional_usd,
        "capabilities": provider.capabilities(),
    });
    Ok(NodeOutput::from_outputs(outputs, summary))
}

async fn assisted_live_ticket(
    deps: &Deps,
    ctx: &NodeCtx,
    product_id: &str,
    side: &str,
    notional_usd: f64,
) -> Result<NodeOutput> {
    let ticket_id = new_id("tkt_");
    let ticket = json!({
        "ticket_id": ticket_id.clone(),
        "symbol": product_id,
        "side": side,
        "notional_usd": notional_usd,
        "order_type": "MARKET",
        "instructions": "Submit manually at your venue; this run does not place live orders.",
        "created_at": now_iso(),
    });
    deps.artifacts()
        .insert(&ctx.run_id, "execution", "order_ticket", &ticket)
        .await?;
    {
        let id = ticket_id.clone();
        let run_id = ctx.run_id.clone();
        let tenant = ctx.tenant_id.clone();
        let ticket_json = ticket.to_string();
        deps.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO trade_tickets (id, run_id, tenant_id, status, ticket_json, created_at)
                     VALUES (?1, ?2, ?3, 'OPEN', ?4, ?5)",
                    rusqlite::params![id, run_id, tenant, ticket_json, now_iso()],
                )?;
                Ok(())
            })
            .await?;
    }
    Ok(NodeOutput::from_outputs(
        json!({"order_ticket": ticket, "submitted": false}),
        format!("Generated order ticket for {side} ${notional_usd:.2} {product_id}"),
    ))
}

fn normalize_product_id(symbol: &str) -> String {
    if symbol.contains('-') {
        symbol.to_string()
    } else {
        format!("{symbol}-USD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_product_id() {
        assert_eq!(normalize_product_id("BTC"), "BTC-USD");
        assert_eq!(normalize_product_id("BTC-USD"), "BTC-USD");
    }
}
