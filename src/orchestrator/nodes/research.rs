//! Research node: fetch candles for the universe and compute per-symbol
//! returns over the intent's lookback window.
//!
//! Every candles response is persisted as a `market_candles_batches` row,
//! which is the sole source of truth for REPLAY: a replay run reads the
//! source run's batches, re-persists them under its own id, and never
//! calls the market-data client.

use anyhow::Result;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::deps::Deps;
use crate::ids::now_iso;
use crate::market_data::{Candle, STABLECOINS};
use crate::orchestrator::nodes::{load_intent, NodeCtx, NodeOutput};

const DYNAMIC_UNIVERSE_CAP: usize = 25;

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let run = deps
        .runs()
        .get(&ctx.run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run {} not found", ctx.run_id))?;
    let intent = load_intent(&run);
    let lookback_hours = intent.lookback_hours.max(1);
    let granularity = if run.asset_class == "STOCK" { "EOD" } else { "1h" };

    let mut returns_by_symbol: BTreeMap<String, f64> = BTreeMap::new();
    let mut last_prices: BTreeMap<String, f64> = BTreeMap::new();
    let mut drop_reasons: BTreeMap<String, String> = BTreeMap::new();
    let mut citations: Vec<serde_json::Value> = Vec::new();
    let mut api_calls = 0u64;
    let mut api_failures = 0u64;
    let universe: Vec<String>;

    if run.execution_mode == "REPLAY" {
        // Replay never consults the catalog: the universe is exactly the
        // set of symbols the source run left evidence for.
        let source_run_id = run
            .source_run_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("REPLAY run {} has no source_run_id", ctx.run_id))?;
        let batches = deps.evidence().list_candles_batches(&source_run_id).await?;
        if batches.is_empty() {
            anyhow::bail!("source run {source_run_id} has no candle batches to replay");
        }
        let mut symbols: Vec<String> = Vec::new();
        for batch in &batches {
            if !symbols.contains(&batch.symbol) {
                symbols.push(batch.symbol.clone());
            }
        }
        universe = symbols;
        for batch in batches {
            let candles: Vec<Candle> =
                serde_json::from_str(&batch.candles_json).unwrap_or_default();
            let batch_id = deps
                .evidence()
                .insert_candles_batch(
                    &ctx.run_id,
                    &batch.symbol,
                    &batch.window,
                    &batch.candles_json,
                    batch.query_params_json.as_deref(),
                )
                .await?;
            match window_return(&candles) {
                Some((ret, last)) => {
                    returns_by_symbol.insert(batch.symbol.clone(), ret);
                    last_prices.insert(batch.symbol.clone(), last);
                    citations.push(json!({"type": "candles_batch", "batch_id": batch_id, "symbol": batch.symbol}));
                }
                None => {
                    drop_reasons.insert(batch.symbol.clone(), "empty candle series in source batch".to_string());
                }
            }
        }
        info!(run_id = %ctx.run_id, source_run_id = %source_run_id, symbols = returns_by_symbol.len(), "research replayed from source evidence");
    } else {
        universe = resolve_universe(deps, &run.locked_product_id, &intent.universe).await;
        for symbol in &universe {
            api_calls += 1;
            let tool_call_id = deps
                .evidence()
                .tool_call_start(
                    &ctx.run_id,
                    Some(&ctx.node_id),
                    "get_candles",
                    &json!({"symbol": symbol, "lookback_hours": lookback_hours}).to_string(),
                )
                .await?;
            match deps.market.get_candles(symbol, lookback_hours).await {
                Ok(candles) => {
                    deps.evidence()
                        .tool_call_finish(&tool_call_id, Some(&json!({"count": candles.len()}).to_string()), None)
                        .await?;
                    let candles_json = serde_json::to_string(&candles)?;
                    let batch_id = deps
                        .evidence()
                        .insert_candles_batch(
                            &ctx.run_id,
                            symbol,
                            &intent.window,
                            &candles_json,
                            Some(&json!({"lookback_hours": lookback_hours, "granularity": granularity}).to_string()),
                        )
                        .await?;
                    match window_return(&candles) {
                        Some((ret, last)) => {
                            returns_by_symbol.insert(symbol.clone(), ret);
                            last_prices.insert(symbol.clone(), last);
                            citations.push(json!({"type": "candles_batch", "batch_id": batch_id, "symbol": symbol}));
                        }
                        None => {
                            drop_reasons
                                .insert(symbol.clone(), "empty candle series".to_string());
                        }
                    }
                }
                Err(e) => {
                    api_failures += 1;
                    deps.evidence()
                        .tool_call_finish(&tool_call_id, None, Some(&e.to_string()))
                        .await?;
                    warn!(run_id = %ctx.run_id, symbol = %symbol, error = %e, "dropping symbol from research");
                    drop_reasons.insert(symbol.clone(), e.to_string());
                }
            }
        }
    }

    if run.asset_class == "STOCK" {
        deps.artifacts()
            .insert(
                &ctx.run_id,
                "research",
                "universe_snapshot",
                &json!({
                    "symbols": universe.clone(),
                    "granularity": "EOD",
                    "data_source": "eod_provider",
                }),
            )
            .await?;
    }

    if returns_by_symbol.is_empty() {
        let top_examples: Vec<serde_json::Value> = drop_reasons
            .iter()
            .take(3)
            .map(|(symbol, reason)| json!({"symbol": symbol, "reason": reason}))
            .collect();
        let rate_limited = drop_reasons
            .values()
            .any(|r| r.to_lowercase().contains("rate limit") || r.contains("429"));
        deps.artifacts()
            .insert(
                &ctx.run_id,
                "research",
                "research_failure",
                &json!({
                    "reason_code": if rate_limited { "PRODUCT_API_RATE_LIMITED" } else { "ALL_ASSETS_DROPPED" },
                    "root_cause_guess": if rate_limited {
                        "market data provider is rate limiting candle requests"
                    } else {
                        "no candle data returned for any universe symbol"
                    },
                    "recommended_fix": "verify the symbols are tradable and retry after the provider cooldown",
                    "dropped_by_reason": drop_reasons,
                    "top_examples": top_examples,
                    "failed_at": now_iso(),
                }),
            )
            .await?;
        anyhow::bail!(
            "research dropped every asset in the universe ({} symbols); see research_failure artifact",
            universe.len()
        );
    }

    let summary = format!(
        "Researched {} symbols, {} ranked, {} dropped",
        universe.len(),
        returns_by_symbol.len(),
        drop_reasons.len()
    );
    let outputs = json!({
        "universe": universe,
        "returns_by_symbol": returns_by_symbol,
        "last_prices_by_symbol": last_prices,
        "drop_reasons": drop_reasons,
        "granularity": granularity,
        "lookback_hours": lookback_hours,
        "citations": citations.clone(),
        "api_call_stats": {"calls": api_calls, "failures": api_failures},
    });
    let mut output = NodeOutput::from_outputs(outputs, summary);
    output.evidence_refs = json!(citations);
    Ok(output)
}

async fn resolve_universe(
    deps: &Deps,
    locked_product_id: &Option<String>,
    intent_universe: &[String],
) -> Vec<String> {
    if let Some(locked) = locked_product_id {
        return vec![locked.clone()];
    }
    let explicit: Vec<String> = intent_universe
        .iter()
        .filter(|s| *s != "AUTO")
        .cloned()
        .collect();
    if !explicit.is_empty() {
        return explicit;
    }
    // Dynamic catalog fallback, minus stablecoins.
    match deps.market.list_products().await {
        Ok(products) => {
            let universe: Vec<String> = products
                .into_iter()
                .filter(|p| !STABLECOINS.contains(&p.base_currency.to_uppercase().as_str()))
                .map(|p| p.product_id)
                .take(DYNAMIC_UNIVERSE_CAP)
                .collect();
            if universe.is_empty() {
                default_universe()
            } else {
                universe
            }
        }
        Err(e) => {
            warn!(error = %e, "dynamic universe fetch failed, using default");
            default_universe()
        }
    }
}

fn default_universe() -> Vec<String> {
    crate::intent::DEFAULT_UNIVERSE.iter().map(|s| s.to_string()).collect()
}

/// Return over the series plus the last close.
fn window_return(candles: &[Candle]) -> Option<(f64, f64)> {
    let first = candles.first()?;
    let last = candles.last()?;
    if first.close <= 0.0 {
        return None;
    }
    Some(((last.close - first.close) / first.close, last.close))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_return() {
        let candles = vec![
            Candle { ts: 1, low: 0.0, high: 0.0, open: 0.0, close: 100.0, volume: 0.0 },
            Candle { ts: 2, low: 0.0, high: 0.0, open: 0.0, close: 110.0, volume: 0.0 },
        ];
        let (ret, last) = window_return(&candles).unwrap();
        assert!((ret - 0.1).abs() < 1e-9);
        assert_eq!(last, 110.0);
        assert!(window_return(&[]).is_none());
    }
}
