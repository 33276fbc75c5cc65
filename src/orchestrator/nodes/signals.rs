//! Signals node: rank research returns and pick the top symbol, honoring
//! the decision lock. Persists the ranking evidence row and the second
//! portfolio snapshot.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::deps::Deps;
use crate::ids::now_iso;
use crate::orchestrator::nodes::{NodeCtx, NodeOutput};

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let run = deps
        .runs()
        .get(&ctx.run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run {} not found", ctx.run_id))?;
    let research = deps
        .nodes()
        .outputs(&ctx.run_id, "research")
        .await?
        .ok_or_else(|| anyhow::anyhow!("research node outputs not found"))?;

    let lookback_hours = research
        .get("lookback_hours")
        .and_then(|v| v.as_i64())
        .unwrap_or(24);
    let mut rankings: Vec<serde_json::Value> = research
        .get("returns_by_symbol")
        .and_then(|r| r.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(symbol, ret)| {
                    ret.as_f64()
                        .map(|r| json!({"symbol": symbol, "return_pct": r}))
                })
                .collect()
        })
        .unwrap_or_default();
    rankings.sort_by(|a, b| {
        let ra = a.get("return_pct").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let rb = b.get("return_pct").and_then(|v| v.as_f64()).unwrap_or(0.0);
        rb.total_cmp(&ra)
    });

    if rankings.is_empty() {
        deps.artifacts()
            .insert(
                &ctx.run_id,
                "signals",
                "signals_failure",
                &json!({
                    "summary": "no valid rankings from research node",
                    "drop_reasons": research.get("drop_reasons"),
                    "lookback_hours": lookback_hours,
                    "failed_at": now_iso(),
                }),
            )
            .await?;
        anyhow::bail!("no valid rankings from research node; every asset was dropped");
    }

    // Decision lock takes priority over any plan-level pre-selection.
    let pre_selected = if let Some(locked) = &run.locked_product_id {
        info!(run_id = %ctx.run_id, locked_product_id = %locked, "using decision lock for signal selection");
        Some(locked.clone())
    } else {
        run.execution_plan_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|plan| plan.get("selected_asset").and_then(|a| a.as_str()).map(String::from))
    };

    let (top_symbol, top_return) = match pre_selected {
        Some(selected) => {
            let hit = rankings.iter().find(|r| {
                r.get("symbol").and_then(|s| s.as_str()) == Some(selected.as_str())
            });
            match hit {
                Some(row) => (
                    selected,
                    row.get("return_pct").and_then(|v| v.as_f64()).unwrap_or(0.0),
                ),
                None => {
                    warn!(run_id = %ctx.run_id, symbol = %selected, "pre-selected asset missing from rankings, injecting with 0 return");
                    rankings.insert(0, json!({"symbol": selected, "return_pct": 0.0}));
                    (selected, 0.0)
                }
            }
        }
        None => {
            let top = &rankings[0];
            (
                top.get("symbol").and_then(|s| s.as_str()).unwrap_or("").to_string(),
                top.get("return_pct").and_then(|v| v.as_f64()).unwrap_or(0.0),
            )
        }
    };

    let last_price = research
        .get("last_prices_by_symbol")
        .and_then(|p| p.get(&top_symbol))
        .and_then(|p| p.as_f64());
    let momentum = if top_return > 0.0 { "positive" } else { "negative" };
    let signal_strength = (top_return.abs() * 10.0).min(1.0);

    let ranking_id = deps
        .evidence()
        .insert_ranking(
            &ctx.run_id,
            &ctx.node_id,
            &format!("{lookback_hours}h"),
            "return_pct",
            &top_symbol,
            top_return,
            &serde_json::to_string(&rankings)?,
        )
        .await?;

    // Snapshot 2: after the ranking decision.
    let state = deps.portfolio().latest_state(&ctx.tenant_id).await?;
    deps.portfolio()
        .insert_snapshot(Some(&ctx.run_id), &ctx.tenant_id, &state)
        .await?;

    let summary = format!(
        "Selected {top_symbol} ({:.2}% over {lookback_hours}h)",
        top_return * 100.0
    );
    let universe_size = rankings.len();
    let outputs = json!({
        "rankings": rankings,
        "top_symbol": top_symbol,
        "top_return": top_return,
        "last_price": last_price,
        "momentum": momentum,
        "signal_strength": signal_strength,
        "universe_size": universe_size,
        "lookback_hours": lookback_hours,
    });
    let mut output = NodeOutput::from_outputs(outputs, summary);
    output.evidence_refs = json!([{"ranking_id": ranking_id}]);
    Ok(output)
}
