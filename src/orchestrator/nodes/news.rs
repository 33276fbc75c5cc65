//! News node: build a brief for the top research candidates and compute
//! the sentiment gate. In REPLAY the brief is reconstructed strictly from
//! the source run's news evidence.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::deps::Deps;
use crate::ids::now_iso;
use crate::news::{compute_sentiment_gate, NewsBriefService};
use crate::orchestrator::nodes::{load_intent, NodeCtx, NodeOutput};

const MAX_NEWS_CANDIDATES: usize = 3;

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let run = deps
        .runs()
        .get(&ctx.run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run {} not found", ctx.run_id))?;

    if !run.news_enabled {
        // The runner already skips this node when news is off; keep the
        // guard so a direct invocation stays safe.
        deps.artifacts()
            .insert(
                &ctx.run_id,
                "news",
                "news_skipped",
                &json!({"reason": "news_enabled=false", "skipped_at": now_iso()}),
            )
            .await?;
        return Ok(NodeOutput::from_outputs(
            json!({"news_skipped": true, "brief": {}, "blockers": [], "sentiment_gate": {}}),
            "News analysis skipped (disabled by user toggle)",
        ));
    }

    let intent = load_intent(&run);
    let candidates = top_candidates(deps, ctx, &run.locked_product_id).await?;
    let base_symbols: Vec<String> = candidates
        .iter()
        .map(|product_id| base_symbol(product_id))
        .fold(Vec::new(), |mut acc, base| {
            if !acc.contains(&base) {
                acc.push(base);
            }
            acc
        });

    let service = NewsBriefService::new(deps.evidence());
    let mut brief = if run.execution_mode == "REPLAY" {
        let source_run_id = run
            .source_run_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("REPLAY run {} has no source_run_id", ctx.run_id))?;
        info!(run_id = %ctx.run_id, source_run_id = %source_run_id, "rebuilding news brief from source evidence");
        service.create_brief_from_source(&ctx.run_id, &source_run_id).await?
    } else {
        let reference_time = chrono::DateTime::parse_from_rfc3339(&run.created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());
        service
            .create_brief(&ctx.run_id, &base_symbols, intent.lookback_hours.max(24), reference_time)
            .await?
    };

    let gate = compute_sentiment_gate(&brief, &base_symbols);
    if gate.gated {
        warn!(
            run_id = %ctx.run_id,
            net_sentiment = gate.net_sentiment,
            confidence = gate.confidence,
            bearish = gate.bearish_count,
            critical = gate.critical_blockers.len(),
            "sentiment gate triggered"
        );
    }
    let gate_json = serde_json::to_value(&gate)?;
    brief["sentiment_gate"] = gate_json.clone();
    brief["blockers"] = json!(gate.critical_blockers.clone());

    deps.artifacts()
        .insert(&ctx.run_id, "news", "news_brief", &brief)
        .await?;

    let headline_count = gate.bullish_count + gate.bearish_count + gate.neutral_count;
    let summary = format!(
        "Analyzed news for {}. Sentiment: {:.2} ({}B/{}b/{}N). {}",
        base_symbols.join(", "),
        gate.net_sentiment,
        gate.bullish_count,
        gate.bearish_count,
        gate.neutral_count,
        if gate.gated {
            format!("GATED: {}", gate.explanation)
        } else {
            "No gate triggered.".to_string()
        }
    );
    let blocker_count = gate.critical_blockers.len();
    let mut output = NodeOutput::from_outputs(
        json!({
            "brief": brief,
            "checked_assets": candidates,
            "blockers": gate.critical_blockers,
            "sentiment_gate": gate_json,
            "headline_count": headline_count,
        }),
        summary,
    );
    output.evidence_refs = json!([{
        "news_brief": true,
        "blocker_count": blocker_count,
        "sentiment_gated": gate.gated,
    }]);
    Ok(output)
}

/// Top candidates by research return (desc), locked product first.
async fn top_candidates(
    deps: &Deps,
    ctx: &NodeCtx,
    locked_product_id: &Option<String>,
) -> Result<Vec<String>> {
    let mut candidates = Vec::new();
    if let Some(locked) = locked_product_id {
        candidates.push(locked.clone());
    }
    if let Some(outputs) = deps.nodes().outputs(&ctx.run_id, "research").await? {
        let mut ranked: Vec<(String, f64)> = outputs
            .get("returns_by_symbol")
            .and_then(|r| r.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(symbol, ret)| ret.as_f64().map(|r| (symbol.clone(), r)))
                    .collect()
            })
            .unwrap_or_default();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        for (symbol, _) in ranked {
            if candidates.len() >= MAX_NEWS_CANDIDATES {
                break;
            }
            if !candidates.contains(&symbol) {
                candidates.push(symbol);
            }
        }
    }
    Ok(candidates)
}

fn base_symbol(product_id: &str) -> String {
    product_id.split('-').next().unwrap_or(product_id).to_string()
}
