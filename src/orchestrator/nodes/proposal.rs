//! Proposal node: build the trade proposal with rationale, persist the
//! decision_record, decision_table, and trade_plan artifacts.
//!
//! A sentiment-gated or critically-blocked BUY yields a blocked proposal
//! (empty orders, confidence 0). Bearish news never blocks a SELL.

use anyhow::Result;
use serde_json::json;
use tracing::warn;

use crate::deps::Deps;
use crate::ids::now_iso;
use crate::orchestrator::nodes::{load_intent, NodeCtx, NodeOutput};

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let run = deps
        .runs()
        .get(&ctx.run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run {} not found", ctx.run_id))?;
    let intent = load_intent(&run);
    let action = intent.side.to_uppercase();
    let is_buy = matches!(action.as_str(), "BUY" | "MARKET_BUY");
    let is_command_run = run.command_text.is_some();

    let signals = deps
        .nodes()
        .outputs(&ctx.run_id, "signals")
        .await?
        .ok_or_else(|| anyhow::anyhow!("signals node outputs not found"))?;
    let mut top_symbol = signals
        .get("top_symbol")
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_string();
    let top_return = signals
        .get("top_return")
        .and_then(|r| r.as_f64())
        .unwrap_or(0.0);

    // Decision lock: the confirmation-time selection is immutable.
    if let Some(locked) = &run.locked_product_id {
        if locked != &top_symbol {
            warn!(
                run_id = %ctx.run_id,
                signals_symbol = %top_symbol,
                locked = %locked,
                "proposal overriding signals output with decision lock"
            );
        }
        top_symbol = locked.clone();
    }

    let risk = deps
        .nodes()
        .outputs(&ctx.run_id, "risk")
        .await?
        .ok_or_else(|| anyhow::anyhow!("risk node outputs not found"))?;
    let final_notional = risk
        .get("final_notional")
        .and_then(|n| n.as_f64())
        .unwrap_or(intent.budget_usd);

    let news = deps.nodes().outputs(&ctx.run_id, "news").await?;
    let sentiment_gate = news
        .as_ref()
        .and_then(|n| n.get("sentiment_gate").cloned())
        .unwrap_or(json!({}));
    let base = top_symbol.split('-').next().unwrap_or(&top_symbol).to_string();
    let critical_blockers: Vec<serde_json::Value> = sentiment_gate
        .get("critical_blockers")
        .and_then(|b| b.as_array())
        .map(|blockers| {
            blockers
                .iter()
                .filter(|b| b.get("asset").and_then(|a| a.as_str()) == Some(base.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let gated = sentiment_gate
        .get("gated")
        .and_then(|g| g.as_bool())
        .unwrap_or(false);
    let is_critical_blocked = !critical_blockers.is_empty() && is_buy;
    let is_blocked = (gated && is_buy) || is_critical_blocked;

    let research = deps.nodes().outputs(&ctx.run_id, "research").await?;
    let citations = research
        .as_ref()
        .and_then(|r| r.get("citations").cloned())
        .unwrap_or(json!([]));
    let granularity = research
        .as_ref()
        .and_then(|r| r.get("granularity").and_then(|g| g.as_str()))
        .unwrap_or("1h")
        .to_string();

    let mut rationale;
    let mut orders = Vec::new();
    if is_blocked {
        rationale = if is_critical_blocked {
            let reasons: Vec<String> = critical_blockers
                .iter()
                .map(|b| {
                    format!(
                        "{} ({})",
                        b.get("keyword").and_then(|k| k.as_str()).unwrap_or("unknown"),
                        b.get("title").and_then(|t| t.as_str()).unwrap_or("news item"),
                    )
                })
                .collect();
            format!("BLOCKED: {top_symbol} has critical security alerts: {}", reasons.join("; "))
        } else {
            format!(
                "BLOCKED: {}",
                sentiment_gate
                    .get("explanation")
                    .and_then(|e| e.as_str())
                    .unwrap_or("bearish sentiment gate triggered")
            )
        };
    } else {
        rationale = if run.asset_class == "STOCK" {
            format!(
                "Selected {top_symbol} based on {:.2}% EOD return. Budget: ${final_notional:.2}. ASSISTED_LIVE mode: order ticket will be generated.",
                top_return * 100.0
            )
        } else {
            format!(
                "Selected {top_symbol} based on {:.2}% return over the lookback window. Budget: ${final_notional:.2}.",
                top_return * 100.0
            )
        };
        match &news {
            None => rationale.push_str(" News analysis disabled."),
            Some(_) => {
                let bearish = sentiment_gate
                    .get("bearish_count")
                    .and_then(|c| c.as_u64())
                    .unwrap_or(0);
                let net = sentiment_gate
                    .get("net_sentiment")
                    .and_then(|n| n.as_f64())
                    .unwrap_or(0.0);
                if bearish > 0 && !is_buy {
                    rationale.push_str(" Bearish news detected (supports SELL decision).");
                } else if net > 0.0 {
                    rationale.push_str(&format!(" News sentiment: positive ({net:.2})."));
                }
            }
        }

        let order_mode = if run.asset_class == "STOCK" || run.execution_mode == "ASSISTED_LIVE" {
            Some("ASSISTED_LIVE")
        } else {
            None
        };
        let mut order = json!({
            "symbol": top_symbol.clone(),
            "side": action.clone(),
            "notional_usd": final_notional,
            "order_type": "MARKET",
        });
        if let Some(mode) = order_mode {
            order["execution_mode"] = json!(mode);
        }
        orders.push(order);
    }

    let confidence = if is_blocked {
        0.0
    } else {
        (0.5 + top_return.abs() * 2.0).min(0.95)
    };
    let proposal = json!({
        "orders": orders,
        "citations": citations,
        "rationale": rationale.clone(),
        "expected_return_24h": top_return,
        "confidence": confidence,
        "chosen_product_id": top_symbol.clone(),
        "tradability_verified": run.tradability_verified,
        "skip_citation_check": is_command_run,
    });

    let constraints_triggered: Vec<serde_json::Value> = critical_blockers
        .iter()
        .map(|b| {
            json!({
                "type": "news",
                "name": "critical_news_blocker",
                "severity": "CRITICAL",
                "details": b.get("keyword").cloned(),
            })
        })
        .collect();
    let decision_record = json!({
        "selected_asset": if is_blocked { None } else { Some(top_symbol.clone()) },
        "action": action.clone(),
        "orders": proposal["orders"].clone(),
        "rationale": rationale.clone(),
        "blockers": critical_blockers.clone(),
        "sentiment_gate": sentiment_gate.clone(),
        "sentiment_gated": gated && is_buy,
        "risk_override_allowed": sentiment_gate.get("risk_override_allowed").and_then(|r| r.as_bool()).unwrap_or(false),
        "constraints_triggered": constraints_triggered,
    });
    deps.artifacts()
        .insert(&ctx.run_id, "proposal", "decision_record", &decision_record)
        .await?;

    let staleness_note = if run.asset_class == "STOCK" || granularity == "EOD" {
        Some("EOD data: prices may be up to 1 business day old")
    } else {
        None
    };
    let ranked_candidates: Vec<serde_json::Value> = signals
        .get("rankings")
        .and_then(|r| r.as_array())
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    let symbol = row.get("symbol").and_then(|s| s.as_str()).unwrap_or("");
                    let ret = row.get("return_pct").and_then(|r| r.as_f64()).unwrap_or(0.0);
                    json!({
                        "symbol": symbol,
                        "return_pct": ret * 100.0,
                        "selected": symbol == top_symbol,
                        "status": if symbol == top_symbol { "selected" } else { "candidate" },
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let decision_table = json!({
        "asset_class": run.asset_class.clone(),
        "granularity": granularity.clone(),
        "staleness_note": staleness_note,
        "ranked_candidates": ranked_candidates,
        "dropped_symbols": research.as_ref().and_then(|r| r.get("drop_reasons").cloned()),
        "final_selection": {
            "symbol": if is_blocked { None } else { Some(top_symbol.clone()) },
            "return_pct": top_return * 100.0,
            "blocked": is_blocked,
            "sentiment_gated": gated && is_buy,
            "block_reason": critical_blockers.first().and_then(|b| b.get("keyword").cloned()),
            "net_sentiment": sentiment_gate.get("net_sentiment").cloned(),
        },
        "created_at": now_iso(),
    });
    deps.artifacts()
        .insert(&ctx.run_id, "proposal", "decision_table", &decision_table)
        .await?;

    let trade_plan = json!({
        "strategy": format!("top_{}_{}", intent.metric, intent.window),
        "metric": intent.metric.clone(),
        "window": {"label": intent.window.clone(), "hours": intent.lookback_hours},
        "selected_asset": if is_blocked { None } else { Some(top_symbol.clone()) },
        "rationale": rationale,
        "constraints": {
            "mode": run.execution_mode.clone(),
            "time_in_force": "IOC",
        },
        "computed_at": now_iso(),
    });
    deps.artifacts()
        .insert(&ctx.run_id, "proposal", "trade_plan", &trade_plan)
        .await?;

    deps.runs()
        .set_trade_proposal(&ctx.run_id, &proposal.to_string())
        .await?;

    let summary = if is_blocked {
        format!("Proposal blocked for {top_symbol}")
    } else {
        format!("Proposed {action} ${final_notional:.2} {top_symbol}")
    };
    Ok(NodeOutput::from_outputs(proposal, summary))
}
