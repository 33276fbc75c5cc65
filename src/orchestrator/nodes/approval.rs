//! Approval node.
//!
//! When policy demanded approval: consume a completed decision if one
//! exists (a rejection fails the run as USER_REJECTED), otherwise create a
//! PENDING approval row and tell the runner to pause.

use anyhow::Result;
use serde_json::json;
use tracing::info;

use crate::deps::Deps;
use crate::errors::{TradeError, TradeErrorCode};
use crate::orchestrator::nodes::{NodeCtx, NodeOutput};

pub async fn execute(deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
    let policy = deps
        .nodes()
        .outputs(&ctx.run_id, "policy_check")
        .await?
        .ok_or_else(|| anyhow::anyhow!("policy_check node outputs not found"))?;
    let decision = policy
        .get("decision")
        .and_then(|d| d.as_str())
        .unwrap_or("ALLOWED");

    if decision == "BLOCKED" {
        // Nothing to approve; execution will fail the run with the reasons.
        return Ok(NodeOutput::from_outputs(
            json!({"approval_required": false, "policy_decision": "BLOCKED"}),
            "No approval path: policy blocked the proposal",
        ));
    }

    if decision != "REQUIRES_APPROVAL" {
        return Ok(NodeOutput::from_outputs(
            json!({"approval_required": false, "policy_decision": decision}),
            "No approval required",
        ));
    }

    if let Some(approval) = deps.approvals().latest_for_run(&ctx.run_id).await? {
        if approval.status == "COMPLETED" {
            match approval.decision.as_deref() {
                Some("APPROVED") => {
                    info!(run_id = %ctx.run_id, approval_id = %approval.approval_id, "consuming approved decision");
                    return Ok(NodeOutput::from_outputs(
                        json!({
                            "approval_required": false,
                            "approval_id": approval.approval_id,
                            "decision": "APPROVED",
                        }),
                        "Approval consumed: APPROVED",
                    ));
                }
                _ => {
                    return Err(TradeError::new(
                        TradeErrorCode::UserRejected,
                        "user rejected the trade proposal",
                    )
                    .into());
                }
            }
        }
        // Still pending: keep the run paused on the same approval row.
        let mut output = NodeOutput::from_outputs(
            json!({"requires_approval": true, "approval_id": approval.approval_id.clone()}),
            "Awaiting user approval",
        );
        output.requires_approval = true;
        output.approval_id = Some(approval.approval_id);
        return Ok(output);
    }

    let approval_id = deps.approvals().create_pending(&ctx.run_id, &ctx.tenant_id).await?;
    info!(run_id = %ctx.run_id, approval_id = %approval_id, "created approval request, pausing run");
    let mut output = NodeOutput::from_outputs(
        json!({"requires_approval": true, "approval_id": approval_id.clone()}),
        "Awaiting user approval",
    );
    output.requires_approval = true;
    output.approval_id = Some(approval_id);
    Ok(output)
}
