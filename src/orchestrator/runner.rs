//! The DAG runner: drives a run from CREATED to a terminal state.
//!
//! One run executes its nodes sequentially under a global cancellable
//! deadline. Completed nodes are skipped on re-entry, which is how a
//! PAUSED run resumes after an approval decision. Every terminal path
//! writes exactly one `trade_receipt` artifact.

use anyhow::Result;
use chrono::DateTime;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::runs::RunRow;
use crate::db::telemetry::TelemetryUpdate;
use crate::deps::Deps;
use crate::errors::{classify_error, TradeError, TradeErrorCode};
use crate::ids::now_iso;
use crate::orchestrator::nodes::{NodeCtx, NodeKind};
use crate::state_machine::RunStatus;
use crate::telemetry;

/// Create a run row in CREATED. `FORCE_PAPER_MODE` downgrades any other
/// execution mode.
pub async fn create_run(
    deps: &Deps,
    tenant_id: &str,
    execution_mode: &str,
    source_run_id: Option<&str>,
    conversation_id: Option<&str>,
) -> Result<String> {
    let mode = if deps.settings.force_paper_mode && execution_mode != "PAPER" {
        warn!(
            requested = execution_mode,
            "FORCE_PAPER_MODE enabled: overriding execution mode to PAPER"
        );
        "PAPER"
    } else {
        execution_mode
    };
    deps.runs()
        .create(tenant_id, mode, source_run_id, conversation_id)
        .await
}

/// Execute a run under the global deadline. Timeouts mark the run FAILED
/// with EXECUTION_TIMEOUT and still produce the failure artifacts.
pub async fn execute_run(deps: &Deps, run_id: &str) -> Result<()> {
    let timeout = Duration::from_secs(deps.settings.execution_timeout_seconds);
    match tokio::time::timeout(timeout, execute_run_body(deps, run_id)).await {
        Ok(result) => result,
        Err(_) => {
            error!(run_id, timeout_s = timeout.as_secs(), "run timed out");
            handle_timeout(deps, run_id, timeout.as_secs()).await;
            Ok(())
        }
    }
}

/// Background worker entry: runs `execute_run` and, if anything escapes,
/// marks the run FAILED with up to 3 retries to survive transient locks.
pub fn spawn_run_worker(deps: Deps, run_id: String) {
    tokio::spawn(async move {
        match execute_run(&deps, &run_id).await {
            Ok(()) => info!(run_id = %run_id, "trade execution worker finished"),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "trade execution worker failed");
                for attempt in 0..3u32 {
                    let marked = deps
                        .runs()
                        .update_status(
                            &run_id,
                            RunStatus::Failed,
                            None,
                            Some(now_iso()),
                            Some(e.to_string()),
                        )
                        .await;
                    match marked {
                        Ok(()) => {
                            let _ = deps.runs().set_failure(&run_id, &e.to_string(), None).await;
                            break;
                        }
                        Err(mark_err) => {
                            error!(
                                run_id = %run_id,
                                attempt = attempt + 1,
                                error = %mark_err,
                                "failed to mark run FAILED"
                            );
                            tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1)))
                                .await;
                        }
                    }
                }
            }
        }
    });
}

async fn handle_timeout(deps: &Deps, run_id: &str, timeout_seconds: u64) {
    let tenant_id = deps
        .runs()
        .get(run_id)
        .await
        .ok()
        .flatten()
        .map(|r| r.tenant_id)
        .unwrap_or_else(|| "t_default".to_string());
    let _ = deps
        .runs()
        .update_status(run_id, RunStatus::Failed, None, Some(now_iso()), None)
        .await;
    let _ = deps
        .runs()
        .set_failure(run_id, "execution timed out", Some("EXECUTION_TIMEOUT"))
        .await;
    let _ = deps
        .artifacts()
        .insert(
            run_id,
            "execution",
            "execution_error",
            &json!({
                "code": "EXECUTION_TIMEOUT",
                "message": format!("Run timed out after {timeout_seconds} seconds"),
                "timeout_seconds": timeout_seconds,
                "occurred_at": now_iso(),
            }),
        )
        .await;
    let error = json!({
        "code": "EXECUTION_TIMEOUT",
        "message": format!("Execution timed out after {timeout_seconds}s"),
        "remediation": TradeErrorCode::ExecutionTimeout.remediation(),
    });
    let _ = build_trade_receipt(deps, run_id, "FAILED", Some(error)).await;
    let _ = deps
        .bus
        .emit(
            run_id,
            "RUN_STATUS",
            json!({"status": "FAILED", "error": "Execution timeout"}),
            &tenant_id,
        )
        .await;
    let _ = deps
        .bus
        .emit(
            run_id,
            "RUN_FAILED",
            json!({"error": "Execution timeout", "code": "EXECUTION_TIMEOUT"}),
            &tenant_id,
        )
        .await;
    telemetry::record_run_failure("UNKNOWN", "EXECUTION_TIMEOUT");
}

async fn execute_run_body(deps: &Deps, run_id: &str) -> Result<()> {
    let run = deps
        .runs()
        .get(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run {run_id} not found"))?;
    let tenant_id = run.tenant_id.clone();
    let execution_mode = run.execution_mode.clone();
    let resuming = run.status == "PAUSED";

    let started_at = now_iso();
    deps.runs()
        .update_status(run_id, RunStatus::Running, Some(started_at.clone()), None, None)
        .await?;
    if let Err(e) = deps
        .telemetry()
        .upsert(
            run_id,
            &tenant_id,
            TelemetryUpdate {
                started_at: Some(started_at.clone()),
                trace_id: run.trace_id.clone(),
                ..Default::default()
            },
        )
        .await
    {
        warn!(run_id, error = %e, "telemetry init failed");
    }

    let nodes = NodeKind::sequence(run.news_enabled);
    if !run.news_enabled && !resuming {
        info!(run_id, "news disabled for run, recording news_skipped artifact");
        deps.artifacts()
            .insert(
                run_id,
                "news",
                "news_skipped",
                &json!({"reason": "news_enabled=false", "skipped_at": now_iso()}),
            )
            .await?;
    }

    if !resuming {
        // Pre-decision snapshot (snapshot 1: run start).
        let state = deps.portfolio().latest_state(&tenant_id).await?;
        deps.portfolio()
            .insert_snapshot(Some(run_id), &tenant_id, &state)
            .await?;

        let plan = build_execution_plan(&run, &nodes);
        deps.runs().set_execution_plan(run_id, &plan.to_string()).await?;
        deps.bus
            .emit(
                run_id,
                "PLAN_CREATED",
                json!({"plan": plan, "step_count": nodes.len()}),
                &tenant_id,
            )
            .await?;
        deps.bus
            .emit(run_id, "RUN_CREATED", json!({"run_id": run_id}), &tenant_id)
            .await?;
        deps.bus
            .emit(
                run_id,
                "RUN_STARTED",
                json!({"run_id": run_id, "started_at": started_at.clone()}),
                &tenant_id,
            )
            .await?;
    }
    deps.bus
        .emit(run_id, "RUN_STATUS", json!({"status": "RUNNING"}), &tenant_id)
        .await?;

    info!(
        run_id,
        mode = %execution_mode,
        tenant = %tenant_id,
        asset_class = %run.asset_class,
        news = run.news_enabled,
        resuming,
        "starting run"
    );

    let nodes_repo = deps.nodes();
    for (sequence, node) in nodes.iter().enumerate() {
        let sequence = sequence + 1;
        let node_name = node.name();

        if nodes_repo.is_completed(run_id, node_name).await? {
            info!(run_id, node = node_name, "skipping completed node");
            continue;
        }

        let node_id = nodes_repo.insert_running(run_id, node_name).await?;
        let step_started = now_iso();
        let description = node.description(&run.asset_class, &execution_mode);
        deps.bus
            .emit(
                run_id,
                "STEP_STARTED",
                json!({
                    "step_id": node_id.clone(),
                    "step_name": node_name,
                    "node_id": node_id.clone(),
                    "sequence": sequence,
                    "description": description,
                    "started_at": step_started.clone(),
                }),
                &tenant_id,
            )
            .await?;
        deps.bus
            .emit(
                run_id,
                "NODE_STARTED",
                json!({"node_id": node_id.clone(), "node_name": node_name}),
                &tenant_id,
            )
            .await?;

        let ctx = NodeCtx {
            run_id: run_id.to_string(),
            node_id: node_id.clone(),
            tenant_id: tenant_id.clone(),
        };
        match node.execute(deps, &ctx).await {
            Ok(output) => {
                nodes_repo.complete(&node_id, &output.outputs.to_string()).await?;
                let step_completed = now_iso();
                let duration_ms = duration_ms_between(&step_started, &step_completed);
                let step_payload = json!({
                    "step_id": node_id.clone(),
                    "step_name": node_name,
                    "sequence": sequence,
                    "status": "completed",
                    "started_at": step_started.clone(),
                    "completed_at": step_completed,
                    "duration_ms": duration_ms,
                    "evidence_refs": output.evidence_refs,
                    "summary": output.safe_summary,
                });
                deps.bus
                    .emit(run_id, "STEP_COMPLETED", step_payload.clone(), &tenant_id)
                    .await?;
                deps.bus
                    .emit(run_id, "STEP_FINISHED", step_payload, &tenant_id)
                    .await?;
                deps.bus
                    .emit(
                        run_id,
                        "NODE_FINISHED",
                        json!({
                            "node_id": node_id.clone(),
                            "node_name": node_name,
                            "result": output.outputs,
                        }),
                        &tenant_id,
                    )
                    .await?;
                if let Some(ms) = duration_ms {
                    telemetry::record_node_latency(node_name, ms as f64 / 1000.0);
                }

                if output.requires_approval {
                    info!(run_id, node = node_name, "run paused for approval");
                    deps.runs()
                        .update_status(run_id, RunStatus::Paused, None, None, None)
                        .await?;
                    deps.bus
                        .emit(run_id, "RUN_STATUS", json!({"status": "PAUSED"}), &tenant_id)
                        .await?;
                    deps.bus
                        .emit(
                            run_id,
                            "APPROVAL_REQUESTED",
                            json!({"run_id": run_id, "approval_id": output.approval_id}),
                            &tenant_id,
                        )
                        .await?;
                    return Ok(());
                }
            }
            Err(e) => {
                return handle_node_failure(
                    deps,
                    run_id,
                    &tenant_id,
                    &execution_mode,
                    node_name,
                    &node_id,
                    sequence,
                    &step_started,
                    e,
                )
                .await;
            }
        }
    }

    finalize_success(deps, run_id, &run, &tenant_id, &execution_mode, &started_at).await
}

#[allow(clippy::too_many_arguments)]
async fn handle_node_failure(
    deps: &Deps,
    run_id: &str,
    tenant_id: &str,
    execution_mode: &str,
    node_name: &str,
    node_id: &str,
    sequence: usize,
    step_started: &str,
    err: anyhow::Error,
) -> Result<()> {
    let error_code = classify_error(&err);
    let error_text = truncate(&err.to_string(), 500);
    error!(run_id, node = node_name, error = %error_text, code = ?error_code, "node failed");

    deps.nodes()
        .fail(
            node_id,
            &json!({"error": error_text.clone(), "error_code": error_code}).to_string(),
        )
        .await?;
    deps.bus
        .emit(
            run_id,
            "STEP_FAILED",
            json!({
                "step_id": node_id,
                "step_name": node_name,
                "sequence": sequence,
                "status": "failed",
                "error": error_text.clone(),
                "error_code": error_code,
                "started_at": step_started,
            }),
            tenant_id,
        )
        .await?;

    deps.runs()
        .update_status(run_id, RunStatus::Failed, None, Some(now_iso()), None)
        .await?;
    deps.runs()
        .set_failure(run_id, &error_text, error_code)
        .await?;

    if let Err(eval_err) = crate::evals::emit_execution_eval(
        deps,
        run_id,
        tenant_id,
        false,
        execution_mode,
        Some(&truncate(&error_text, 200)),
        None,
    )
    .await
    {
        warn!(run_id, error = %eval_err, "failure eval emission failed");
    }

    let receipt_error = match err.downcast_ref::<TradeError>() {
        Some(te) => te.to_error_json(),
        None => json!({
            "code": error_code.unwrap_or("NodeError"),
            "message": error_text.clone(),
        }),
    };
    build_trade_receipt(deps, run_id, "FAILED", Some(receipt_error)).await?;

    deps.bus
        .emit(
            run_id,
            "RUN_STATUS",
            json!({
                "status": "FAILED",
                "error": error_text.clone(),
                "executed": false,
                "order_status": "not_submitted",
            }),
            tenant_id,
        )
        .await?;
    deps.bus
        .emit(
            run_id,
            "RUN_FAILED",
            json!({
                "error": error_text.clone(),
                "executed": false,
                "order_status": "not_submitted",
                "error_code": error_code,
                "message": "Order not submitted. No trade was placed.",
            }),
            tenant_id,
        )
        .await?;

    telemetry::record_run_failure(execution_mode, error_code.unwrap_or("NodeError"));
    telemetry::record_node_failure(node_name, error_code.unwrap_or("NodeError"));

    update_final_telemetry(deps, run_id, tenant_id, Some(&error_text)).await;
    Ok(())
}

async fn finalize_success(
    deps: &Deps,
    run_id: &str,
    run: &RunRow,
    tenant_id: &str,
    execution_mode: &str,
    started_at: &str,
) -> Result<()> {
    // Insight-derived evals come from the confirmation that spawned us.
    let conversation_id = run.conversation_id.clone();
    if let Err(e) = crate::evals::emit_execution_eval(
        deps,
        run_id,
        tenant_id,
        true,
        execution_mode,
        None,
        conversation_id.as_deref(),
    )
    .await
    {
        warn!(run_id, error = %e, "execution eval failed");
    }
    if let Some(insight) = load_confirmation_insight(deps, run_id).await {
        if let Err(e) = crate::evals::emit_insight_evals(
            deps,
            run_id,
            tenant_id,
            &insight,
            conversation_id.as_deref(),
        )
        .await
        {
            warn!(run_id, error = %e, "insight evals failed");
        }
    }
    if let Err(e) = crate::evals::emit_tool_success_rate(deps, run_id, tenant_id).await {
        warn!(run_id, error = %e, "tool success rate eval failed");
    }

    let completed_at = now_iso();
    deps.runs()
        .update_status(run_id, RunStatus::Completed, None, Some(completed_at.clone()), None)
        .await?;
    build_trade_receipt(deps, run_id, "COMPLETED", None).await?;

    if let Err(e) = crate::evals::emit_response_format_eval(deps, run_id, tenant_id).await {
        warn!(run_id, error = %e, "response format eval failed");
    }
    if let Err(e) = crate::evals::emit_run_state_consistency(deps, run_id, tenant_id).await {
        warn!(run_id, error = %e, "run state consistency eval failed");
    }

    deps.bus
        .emit(run_id, "RUN_STATUS", json!({"status": "COMPLETED"}), tenant_id)
        .await?;

    let summary = deps
        .artifacts()
        .get_latest(run_id, "run_status_summary")
        .await?
        .and_then(|s| s.get("summary").and_then(|v| v.as_str()).map(String::from));
    let mut completion = json!({"summary": summary, "status": "COMPLETED"});
    if let Some(order) = deps.orders().last_for_run(run_id).await? {
        completion["order_status"] = json!(order.status);
        if let Some(filled_qty) = order.filled_qty {
            completion["filled_qty"] = json!(filled_qty);
        }
        if let Some(avg_fill_price) = order.avg_fill_price {
            completion["avg_fill_price"] = json!(avg_fill_price);
        }
    }
    deps.bus
        .emit(run_id, "RUN_COMPLETED", completion, tenant_id)
        .await?;

    let duration_s = duration_ms_between(started_at, &completed_at)
        .map(|ms| ms as f64 / 1000.0)
        .unwrap_or(0.0);
    telemetry::record_run_success(execution_mode, duration_s);
    update_final_telemetry(deps, run_id, tenant_id, None).await;
    info!(run_id, duration_s, "run completed");
    Ok(())
}

async fn update_final_telemetry(deps: &Deps, run_id: &str, tenant_id: &str, last_error: Option<&str>) {
    let ended_at = now_iso();
    let duration_ms = deps
        .runs()
        .get(run_id)
        .await
        .ok()
        .flatten()
        .and_then(|r| r.started_at)
        .and_then(|started| duration_ms_between(&started, &ended_at));
    let (tool_calls, tool_failures) = deps
        .evidence()
        .tool_call_counts(run_id)
        .await
        .unwrap_or((0, 0));
    let events = deps.events().count_for_run(run_id).await.unwrap_or(0);
    let error_count = tool_failures + if last_error.is_some() { 1 } else { 0 };
    if let Err(e) = deps
        .telemetry()
        .upsert(
            run_id,
            tenant_id,
            TelemetryUpdate {
                ended_at: Some(ended_at),
                duration_ms,
                tool_calls_count: Some(tool_calls),
                sse_events_count: Some(events),
                error_count: Some(error_count),
                last_error: last_error.map(|s| s.to_string()),
                ..Default::default()
            },
        )
        .await
    {
        warn!(run_id, error = %e, "final telemetry update failed");
    }
}

/// Write the terminal `trade_receipt` plus the one-line status summary.
pub async fn build_trade_receipt(
    deps: &Deps,
    run_id: &str,
    terminal_status: &str,
    error: Option<serde_json::Value>,
) -> Result<()> {
    let Some(run) = deps.runs().get(run_id).await? else {
        return Ok(());
    };
    let intent: serde_json::Value = run
        .parsed_intent_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(json!({}));
    let order = deps.orders().last_for_run(run_id).await?;

    let requested_notional = intent
        .get("budget_usd")
        .and_then(|b| b.as_f64())
        .unwrap_or(0.0);
    let executed_notional = order.as_ref().map(|o| o.notional_usd);
    let side = intent
        .get("side")
        .and_then(|s| s.as_str())
        .unwrap_or("UNKNOWN")
        .to_uppercase();
    let symbol = order
        .as_ref()
        .map(|o| o.symbol.clone())
        .or_else(|| run.locked_product_id.clone())
        .or_else(|| {
            intent
                .get("universe")
                .and_then(|u| u.as_array())
                .and_then(|u| u.first())
                .and_then(|s| s.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let status = if terminal_status == "COMPLETED" { "EXECUTED" } else { "FAILED" };
    let evidence = deps.artifacts().evidence_refs(run_id).await?;
    let receipt = json!({
        "status": status,
        "mode": run.execution_mode.clone(),
        "side": side.clone(),
        "asset_class": run.asset_class.clone(),
        "symbol": symbol.clone(),
        "requested_notional_usd": requested_notional,
        "executed_notional_usd": executed_notional,
        "notional_usd": executed_notional.unwrap_or(requested_notional),
        "order_id": order.as_ref().map(|o| o.order_id.clone()),
        "filled_qty": order.as_ref().and_then(|o| o.filled_qty),
        "avg_fill_price": order.as_ref().and_then(|o| o.avg_fill_price),
        "fees_usd": order.as_ref().and_then(|o| o.total_fees),
        "placed_at": order.as_ref().map(|o| o.created_at.clone()),
        "completed_at": run.completed_at.clone().unwrap_or_else(now_iso),
        "error": error,
        "evidence": evidence,
        "venue": {
            "name": order.as_ref().map(|o| o.provider.clone()).unwrap_or_else(|| "NONE".to_string()),
            "execution_mode": run.execution_mode.clone(),
            "order_type": order.as_ref().map(|o| o.order_type.clone()).unwrap_or_else(|| "MARKET".to_string()),
        },
    });
    deps.artifacts()
        .insert(run_id, "terminal", "trade_receipt", &receipt)
        .await?;

    let summary = json!({
        "run_id": run_id,
        "status": terminal_status,
        "ended_at": now_iso(),
        "summary": format!(
            "{} {} ${:.2} {} - {}",
            run.execution_mode, side, requested_notional, symbol, status
        ),
    });
    deps.artifacts()
        .insert(run_id, "terminal", "run_status_summary", &summary)
        .await?;
    Ok(())
}

fn build_execution_plan(run: &RunRow, nodes: &[NodeKind]) -> serde_json::Value {
    let steps: Vec<serde_json::Value> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            json!({
                "step_id": format!("step_{}", i + 1),
                "step_name": node.name(),
                "description": node.description(&run.asset_class, &run.execution_mode),
                "sequence": i + 1,
                "status": "pending",
            })
        })
        .collect();
    let mut plan = json!({"steps": steps, "decision_trace": []});

    // Preserve any confirmation-time selection stored on the run.
    if let Some(existing) = run
        .execution_plan_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
    {
        for key in ["selected_asset", "selected_order", "decision_trace"] {
            if let Some(value) = existing.get(key) {
                plan[key] = value.clone();
            }
        }
    }
    plan
}

fn duration_ms_between(start: &str, end: &str) -> Option<i64> {
    let start = DateTime::parse_from_rfc3339(start).ok()?;
    let end = DateTime::parse_from_rfc3339(end).ok()?;
    Some((end - start).num_milliseconds())
}

async fn load_confirmation_insight(deps: &Deps, run_id: &str) -> Option<serde_json::Value> {
    let run_id = run_id.to_string();
    let raw: Option<String> = deps
        .db
        .with_conn(move |conn| {
            use rusqlite::OptionalExtension;
            conn.query_row(
                "SELECT insight_json FROM trade_confirmations WHERE run_id = ?1 LIMIT 1",
                rusqlite::params![run_id],
                |r| r.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|v| v.flatten())
        })
        .await
        .ok()
        .flatten();
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_ms() {
        let ms = duration_ms_between("2026-01-01T00:00:00.000Z", "2026-01-01T00:00:01.500Z");
        assert_eq!(ms, Some(1500));
        assert!(duration_ms_between("bogus", "2026-01-01T00:00:00Z").is_none());
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // Multi-byte char straddling the cut.
        let s = "ab\u{00e9}cd";
        let t = truncate(s, 3);
        assert!(s.starts_with(&t));
    }
}
