//! Policy check node: run the deterministic policy over the stored
//! proposal, persist the policy event, and emit POLICY_DECISION.

use anyhow::Result;
use rusqlite::params;
use serde_json::json;

use crate::deps::Deps;
use crate::ids::{new_id, now_iso};
use crate::orchestrator::nodes::{NodeCtx, NodeOutput};
use crate::policy::{check_policy, PolicyOutcome};

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

    let existing_order_count = deps.orders().count_for_run(&ctx.run_id).await?;
    let tenant_kill_switch = deps.runs().tenant_kill_switch(&ctx.tenant_id).await?;

    let decision = check_policy(
        &deps.settings,
        tenant_kill_switch,
        &proposal,
        existing_order_count,
        &run.execution_mode,
    );

    let event_id = new_id("pol_");
    let reasons_json = serde_json::to_string(&decision.reasons)?;
    {
        let id = event_id.clone();
        let run_id = ctx.run_id.clone();
        let node_id = ctx.node_id.clone();
        let decision_str = decision.decision.as_str().to_string();
        let reasons = reasons_json.clone();
        deps.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO policy_events (id, run_id, node_id, decision, reasons_json, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, run_id, node_id, decision_str, reasons, now_iso()],
                )?;
                Ok(())
            })
            .await?;
    }

    deps.bus
        .emit(
            &ctx.run_id,
            "POLICY_DECISION",
            json!({
                "decision": decision.decision.as_str(),
                "reasons": decision.reasons.clone(),
                "summary": format!("Policy check: {}", decision.decision.as_str()),
            }),
            &ctx.tenant_id,
        )
        .await?;
    if decision.decision == PolicyOutcome::RequiresApproval {
        deps.bus
            .emit(
                &ctx.run_id,
                "APPROVAL_REQUIRED",
                json!({"reason": decision.reasons.join("; ")}),
                &ctx.tenant_id,
            )
            .await?;
    }

    let summary = format!("Policy check: {}", decision.decision.as_str());
    let mut output = NodeOutput::from_outputs(
        json!({
            "decision": decision.decision.as_str(),
            "reasons": decision.reasons,
        }),
        summary,
    );
    output.evidence_refs = json!([{"policy_event_id": event_id}]);
    Ok(output)
}
