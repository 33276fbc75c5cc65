//! Approval decision endpoint: resume or fail a paused run.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::ids::now_iso;
use crate::middleware::{AuthContext, RequestId};
use crate::orchestrator::runner;
use crate::state_machine::RunStatus;

#[derive(Debug, Deserialize)]
pub struct ApprovalDecision {
    pub decision: String,
}

pub async fn decide_approval(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(approval_id): Path<String>,
    Json(body): Json<ApprovalDecision>,
) -> Result<Json<Value>, ApiError> {
    auth.require_trader(request_id.as_str())?;
    let request_id = request_id.as_str();
    let decision = body.decision.to_uppercase();
    if !matches!(decision.as_str(), "APPROVED" | "REJECTED") {
        return Err(ApiError::bad_request(
            "INVALID_DECISION",
            "decision must be APPROVED or REJECTED",
            request_id,
        ));
    }

    let approval = state
        .deps
        .approvals()
        .get(&auth.tenant_id, &approval_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?
        .ok_or_else(|| ApiError::not_found("Approval request not found", request_id))?;
    if approval.status != "PENDING" {
        return Err(ApiError::conflict(
            "APPROVAL_ALREADY_DECIDED",
            format!("Approval is already {}", approval.status),
            request_id,
        ));
    }

    let decided = state
        .deps
        .approvals()
        .decide(&approval_id, &decision, &auth.user_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
    if !decided {
        return Err(ApiError::conflict(
            "APPROVAL_ALREADY_DECIDED",
            "Approval was decided concurrently",
            request_id,
        ));
    }

    let run_id = approval.run_id.clone();
    info!(approval_id = %approval_id, run_id = %run_id, decision = %decision, "approval decided");

    if decision == "APPROVED" {
        state
            .deps
            .runs()
            .update_status(&run_id, RunStatus::Running, None, None, None)
            .await
            .map_err(|e| ApiError::from_internal(e, request_id))?;
        let _ = state
            .deps
            .bus
            .emit(&run_id, "RUN_STATUS", json!({"status": "RUNNING"}), &auth.tenant_id)
            .await;
        let _ = state
            .deps
            .bus
            .emit(
                &run_id,
                "APPROVAL_DECISION",
                json!({"decision": "APPROVED", "approval_id": approval_id}),
                &auth.tenant_id,
            )
            .await;
        // Re-enter the runner; completed nodes are skipped on resume.
        runner::spawn_run_worker(state.deps.clone(), run_id.clone());
    } else {
        state
            .deps
            .runs()
            .update_status(&run_id, RunStatus::Failed, None, Some(now_iso()), None)
            .await
            .map_err(|e| ApiError::from_internal(e, request_id))?;
        state
            .deps
            .runs()
            .set_failure(&run_id, "user rejected trade proposal", Some("USER_REJECTED"))
            .await
            .map_err(|e| ApiError::from_internal(e, request_id))?;
        runner::build_trade_receipt(
            &state.deps,
            &run_id,
            "FAILED",
            Some(json!({
                "code": "USER_REJECTED",
                "message": "User rejected the trade proposal",
            })),
        )
        .await
        .map_err(|e| ApiError::from_internal(e, request_id))?;
        let _ = state
            .deps
            .bus
            .emit(&run_id, "RUN_STATUS", json!({"status": "FAILED"}), &auth.tenant_id)
            .await;
        let _ = state
            .deps
            .bus
            .emit(
                &run_id,
                "APPROVAL_DECISION",
                json!({"decision": "REJECTED", "approval_id": approval_id}),
                &auth.tenant_id,
            )
            .await;
        let _ = state
            .deps
            .bus
            .emit(
                &run_id,
                "RUN_FAILED",
                json!({"error": "User rejected trade proposal", "code": "USER_REJECTED"}),
                &auth.tenant_id,
            )
            .await;
    }

    Ok(Json(json!({"status": "success", "decision": decision, "run_id": run_id})))
}
