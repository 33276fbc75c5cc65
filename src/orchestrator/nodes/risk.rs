//! Risk node: budget clamping, minimum order size, and the informational
//! fee buffer.
//!
//! The fee buffer is NOT subtracted from the order size: venue market BUY
//! orders sized by quote already deduct fees inside the quote amount, so
//! subtracting here would double-count and send less than the user asked.

use anyhow::Result;
use serde_json::json;

use crate::deps::Deps;
use crate::errors::{TradeError, TradeErrorCode};
use crate::orchestrator::nodes::{load_intent, NodeCtx, NodeOutput};

pub const FEE_RATE: f64 = 0.006;
pub const MIN_ORDER_SIZE_USD: f64 = 1.0;

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let run = deps
        .runs()
        .get(&ctx.run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run {} not found", ctx.run_id))?;
    let intent = load_intent(&run);
    let signals = deps
        .nodes()
        .outputs(&ctx.run_id, "signals")
        .await?
        .ok_or_else(|| anyhow::anyhow!("signals node outputs not found"))?;
    let top_symbol = signals
        .get("top_symbol")
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_string();

    let budget_usd = intent.budget_usd;
    let max_notional = budget_usd.min(deps.settings.max_notional_per_order_usd);
    let fee_buffer = max_notional * FEE_RATE;

    if max_notional < MIN_ORDER_SIZE_USD {
        return Err(TradeError::new(
            TradeErrorCode::MinNotionalTooHigh,
            format!("order notional ${max_notional:.2} below minimum ${MIN_ORDER_SIZE_USD}"),
        )
        .into());
    }

    let final_notional = max_notional;

    let outputs = json!({
        "budget_usd": budget_usd,
        "requested_notional_usd": budget_usd,
        "max_notional": max_notional,
        "fee_buffer_informational": fee_buffer,
        "fee_rate": FEE_RATE,
        "final_notional": final_notional,
        "min_order_size_usd": MIN_ORDER_SIZE_USD,
        "budget_compliance": final_notional <= budget_usd,
        "top_symbol": top_symbol,
    });
    Ok(NodeOutput::from_outputs(
        outputs,
        format!("Sized order at ${final_notional:.2} (budget ${budget_usd:.2})"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::Db;
    use crate::deps::Deps;
    use crate::market_data::StubMarketData;
    use crate::models::TradeIntent;

    async fn deps_with_run(budget: f64) -> (Deps, NodeCtx) {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let mut settings = Settings::from_env();
        settings.max_notional_per_order_usd = 100.0;
        let deps = Deps::new(db, settings, StubMarketData::new());
        let run_id = deps.runs().create("t_default", "PAPER", None, None).await.unwrap();
        let intent = TradeIntent {
            side: "BUY".to_string(),
            budget_usd: budget,
            metric: "return".to_string(),
            window: "24h".to_string(),
            lookback_hours: 24,
            universe: vec!["BTC-USD".to_string()],
            raw_command: "test".to_string(),
            constraints: serde_json::json!({}),
        };
        deps.runs()
            .set_trade_fields(
                &run_id,
                "test",
                "{}",
                &serde_json::to_string(&intent).unwrap(),
                "{}",
                true,
                "CRYPTO",
                None,
                None,
            )
            .await
            .unwrap();
        let node_id = deps.nodes().insert_running(&run_id, "signals").await.unwrap();
        deps.nodes()
            .complete(&node_id, r#"{"top_symbol":"BTC-USD"}"#)
            .await
            .unwrap();
        let ctx = NodeCtx {
            run_id,
            node_id: "node_risk".to_string(),
            tenant_id: "t_default".to_string(),
        };
        (deps, ctx)
    }

    #[tokio::test]
    async fn test_fee_buffer_not_subtracted() {
        let (deps, ctx) = deps_with_run(2.0).await;
        let out = execute(&deps, &ctx).await.unwrap();
        assert_eq!(out.outputs["final_notional"], 2.0);
        let buffer = out.outputs["fee_buffer_informational"].as_f64().unwrap();
        assert!((buffer - 0.012).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_budget_clamped_to_limit() {
        let (deps, ctx) = deps_with_run(250.0).await;
        let out = execute(&deps, &ctx).await.unwrap();
        assert_eq!(out.outputs["final_notional"], 100.0);
    }

    #[tokio::test]
    async fn test_below_minimum_rejected() {
        let (deps, ctx) = deps_with_run(0.5).await;
        let err = execute(&deps, &ctx).await.unwrap_err();
        let te = err.downcast_ref::<TradeError>().unwrap();
        assert_eq!(te.code, TradeErrorCode::MinNotionalTooHigh);
    }
}
