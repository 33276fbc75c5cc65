//! Eval node: emit the artifact-backed evaluator rows. The terminal
//! evaluators that need the receipt (format, consistency, execution
//! quality) run from the runner's finalize path after the receipt exists.

use anyhow::Result;
use serde_json::json;
use tracing::warn;

use crate::deps::Deps;
use crate::evals;
use crate::orchestrator::nodes::{NodeCtx, NodeOutput};

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let run = deps
        .runs()
        .get(&ctx.run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run {} not found", ctx.run_id))?;
    let mut emitted = Vec::new();

    let research = deps.nodes().outputs(&ctx.run_id, "research").await?;
    let citations = research
        .as_ref()
        .and_then(|r| r.get("citations").and_then(|c| c.as_array()).map(|c| c.len()))
        .unwrap_or(0);
    if let Err(e) = evals::emit_retrieval_eval(deps, &ctx.run_id, &ctx.tenant_id, citations, None).await {
        warn!(run_id = %ctx.run_id, error = %e, "retrieval eval failed");
    } else {
        emitted.push("retrieval_relevance");
    }

    let news = deps.nodes().outputs(&ctx.run_id, "news").await?;
    let headline_count = news
        .as_ref()
        .and_then(|n| n.get("headline_count").and_then(|c| c.as_u64()))
        .unwrap_or(0) as usize;
    if let Err(e) = evals::emit_news_coverage_eval(
        deps,
        &ctx.run_id,
        &ctx.tenant_id,
        run.news_enabled,
        headline_count,
        None,
    )
    .await
    {
        warn!(run_id = %ctx.run_id, error = %e, "news coverage eval failed");
    } else {
        emitted.push("news_coverage");
    }

    if let Err(e) = evals::emit_stock_window_honesty(deps, &ctx.run_id, &ctx.tenant_id).await {
        warn!(run_id = %ctx.run_id, error = %e, "stock window honesty eval failed");
    } else if run.asset_class == "STOCK" {
        emitted.push("stock_window_honesty");
    }

    let summary = format!("Emitted {} eval rows", emitted.len());
    Ok(NodeOutput::from_outputs(json!({"evals_emitted": emitted}), summary))
}
