//! Eval read endpoints.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::middleware::{AuthContext, RequestId};

#[derive(Debug, Deserialize)]
pub struct EvalResultsQuery {
    pub run_id: String,
}

pub async fn eval_results(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<EvalResultsQuery>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    // Tenant scoping happens through the run lookup.
    let run = state
        .deps
        .runs()
        .get_scoped(&auth.tenant_id, &query.run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
    if run.is_none() {
        return Err(ApiError::not_found("Run not found", request_id.as_str()));
    }
    let rows = state
        .deps
        .evals()
        .list_for_run(&query.run_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
    Ok(Json(json!(rows)))
}

pub async fn eval_summary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Value>, ApiError> {
    auth.require_viewer(request_id.as_str())?;
    let summary = state
        .deps
        .evals()
        .summary(&auth.tenant_id)
        .await
        .map_err(|e| ApiError::from_internal(e, request_id.as_str()))?;
    Ok(Json(json!(summary)))
}
