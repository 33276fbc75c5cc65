//! Heuristic evaluators. Each emitter writes one or more scored
//! `eval_results` rows with machine-readable reasons; scores live in
//! [0, 1]. Failures here are never fatal to a run.

use anyhow::Result;
use serde_json::json;

use crate::db::evals::NewEval;
use crate::deps::Deps;

/// 1.0 on success, 0.0 on failure; reasons carry the mode and error.
pub async fn emit_execution_eval(
    deps: &Deps,
    run_id: &str,
    tenant_id: &str,
    success: bool,
    mode: &str,
    error: Option<&str>,
    conversation_id: Option<&str>,
) -> Result<()> {
    let score = if success { 1.0 } else { 0.0 };
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id,
            eval_name: "execution_quality",
            score,
            reasons: json!({
                "success": success,
                "mode": mode,
                "error": error,
            }),
            step_name: Some("execution"),
            eval_category: "execution",
            thresholds: None,
        })
        .await?;
    Ok(())
}

/// Groundedness / faithfulness / answer relevance over the stored insight.
pub async fn emit_insight_evals(
    deps: &Deps,
    run_id: &str,
    tenant_id: &str,
    insight: &serde_json::Value,
    conversation_id: Option<&str>,
) -> Result<()> {
    let confidence = insight
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.5);
    let key_facts = insight
        .get("key_facts")
        .and_then(|f| f.as_array())
        .map(|f| f.len())
        .unwrap_or(0);
    let has_sources = insight
        .get("sources")
        .map(|s| !s.is_null())
        .unwrap_or(false);

    let groundedness = confidence.min(1.0);
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id,
            eval_name: "groundedness",
            score: groundedness,
            reasons: json!({"confidence": confidence, "has_sources": has_sources}),
            step_name: None,
            eval_category: "insight",
            thresholds: None,
        })
        .await?;

    let mut faithfulness = (confidence * 1.1).min(1.0);
    if !has_sources {
        faithfulness = 0.3;
    } else if key_facts >= 2 {
        faithfulness = (faithfulness + 0.1).min(1.0);
    }
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id,
            eval_name: "faithfulness",
            score: faithfulness,
            reasons: json!({"key_facts": key_facts, "has_sources": has_sources}),
            step_name: None,
            eval_category: "insight",
            thresholds: None,
        })
        .await?;

    let relevance = if key_facts >= 2 { 0.8 } else { 0.5 };
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id,
            eval_name: "answer_relevance",
            score: relevance,
            reasons: json!({"key_facts": key_facts}),
            step_name: None,
            eval_category: "insight",
            thresholds: None,
        })
        .await?;
    Ok(())
}

/// Retrieval relevance proxy over the ranked research citations.
pub async fn emit_retrieval_eval(
    deps: &Deps,
    run_id: &str,
    tenant_id: &str,
    citations: usize,
    conversation_id: Option<&str>,
) -> Result<()> {
    let score = (citations as f64 / 3.0).min(1.0);
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id,
            eval_name: "retrieval_relevance",
            score,
            reasons: json!({"citations": citations}),
            step_name: Some("research"),
            eval_category: "retrieval",
            thresholds: None,
        })
        .await?;
    Ok(())
}

/// Score 0 when news was enabled but no headlines were found.
pub async fn emit_news_coverage_eval(
    deps: &Deps,
    run_id: &str,
    tenant_id: &str,
    news_enabled: bool,
    headlines_count: usize,
    conversation_id: Option<&str>,
) -> Result<()> {
    let score = if !news_enabled {
        1.0
    } else if headlines_count > 0 {
        (headlines_count as f64 / 3.0).min(1.0)
    } else {
        0.0
    };
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id,
            eval_name: "news_coverage",
            score,
            reasons: json!({"news_enabled": news_enabled, "headlines_count": headlines_count}),
            step_name: Some("news"),
            eval_category: "news",
            thresholds: None,
        })
        .await?;
    Ok(())
}

/// Ratio of succeeded tool calls; 1.0 when the run made none.
pub async fn emit_tool_success_rate(deps: &Deps, run_id: &str, tenant_id: &str) -> Result<()> {
    let (total, failed) = deps.evidence().tool_call_counts(run_id).await?;
    let score = if total > 0 {
        (total - failed) as f64 / total as f64
    } else {
        1.0
    };
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id: None,
            eval_name: "tool_success_rate",
            score,
            reasons: json!({"total": total, "failed": failed}),
            step_name: None,
            eval_category: "tools",
            thresholds: None,
        })
        .await?;
    Ok(())
}

/// Four structural checks over the terminal receipt.
pub async fn emit_response_format_eval(deps: &Deps, run_id: &str, tenant_id: &str) -> Result<()> {
    let receipt = deps.artifacts().get_latest(run_id, "trade_receipt").await?;
    let score = match &receipt {
        Some(receipt) => {
            let checks = [
                receipt.get("status").and_then(|s| s.as_str()).is_some(),
                receipt.get("mode").and_then(|s| s.as_str()).is_some(),
                receipt.get("symbol").and_then(|s| s.as_str()).is_some(),
                receipt.get("completed_at").and_then(|s| s.as_str()).is_some(),
            ];
            checks.iter().filter(|c| **c).count() as f64 / checks.len() as f64
        }
        None => 0.0,
    };
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id: None,
            eval_name: "response_format_score",
            score,
            reasons: json!({"has_receipt": receipt.is_some()}),
            step_name: Some("eval"),
            eval_category: "format",
            thresholds: None,
        })
        .await?;
    Ok(())
}

/// Consistency between terminal run state and its persisted evidence: a
/// terminal run must have exactly one receipt, and a FILLED paper order
/// must carry its fill columns.
pub async fn emit_run_state_consistency(deps: &Deps, run_id: &str, tenant_id: &str) -> Result<()> {
    let run = deps.runs().get(run_id).await?;
    let mut score: f64 = 1.0;
    let mut problems = Vec::new();

    if let Some(run) = &run {
        let terminal = matches!(run.status.as_str(), "COMPLETED" | "FAILED");
        let receipts = deps
            .artifacts()
            .list(run_id)
            .await?
            .into_iter()
            .filter(|a| a.artifact_type == "trade_receipt")
            .count();
        if terminal && receipts != 1 {
            score = 0.0;
            problems.push(format!("terminal run has {receipts} trade_receipt artifacts"));
        }
        for order in deps.orders().list_for_run(run_id).await? {
            if order.status == "FILLED"
                && (order.filled_qty.is_none()
                    || order.avg_fill_price.is_none()
                    || order.total_fees.is_none())
            {
                score = 0.0;
                problems.push(format!("order {} FILLED with null fill columns", order.order_id));
            }
        }
    } else {
        score = 0.0;
        problems.push("run row missing".to_string());
    }

    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id: None,
            eval_name: "run_state_consistency",
            score,
            reasons: json!({"problems": problems}),
            step_name: Some("eval"),
            eval_category: "consistency",
            thresholds: None,
        })
        .await?;
    Ok(())
}

/// Stock runs must disclose EOD staleness wherever a window is claimed.
pub async fn emit_stock_window_honesty(deps: &Deps, run_id: &str, tenant_id: &str) -> Result<()> {
    let run = deps.runs().get(run_id).await?;
    let Some(run) = run else { return Ok(()) };
    if run.asset_class != "STOCK" {
        return Ok(());
    }
    let table = deps.artifacts().get_latest(run_id, "decision_table").await?;
    let (granularity, has_note) = table
        .as_ref()
        .map(|t| {
            (
                t.get("granularity").and_then(|g| g.as_str()).unwrap_or("").to_string(),
                t.get("staleness_note").map(|n| !n.is_null()).unwrap_or(false),
            )
        })
        .unwrap_or_default();
    let score = if granularity == "EOD" && has_note { 1.0 } else { 0.0 };
    deps.evals()
        .insert(NewEval {
            run_id,
            tenant_id,
            conversation_id: None,
            eval_name: "stock_window_honesty",
            score,
            reasons: json!({"granularity": granularity, "staleness_note_present": has_note}),
            step_name: Some("eval"),
            eval_category: "disclosure",
            thresholds: None,
        })
        .await?;
    Ok(())
}
