//! Approval rows: PENDING until a decision completes them.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::db::Db;
use crate::ids::{new_id, now_iso};

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRow {
    pub approval_id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub status: String,
    pub decision: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<String>,
}

impl ApprovalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            approval_id: row.get("approval_id")?,
            run_id: row.get("run_id")?,
            tenant_id: row.get("tenant_id")?,
            status: row.get("status")?,
            decision: row.get("decision")?,
            decided_by: row.get("decided_by")?,
            decided_at: row.get("decided_at")?,
        })
    }
}

const SELECT_APPROVAL: &str =
    "SELECT approval_id, run_id, tenant_id, status, decision, decided_by, decided_at FROM approvals";

#[derive(Clone)]
pub struct ApprovalsRepo {
    db: Db,
}

impl ApprovalsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create_pending(&self, run_id: &str, tenant_id: &str) -> Result<String> {
        let approval_id = new_id("appr_");
        let id = approval_id.clone();
        let run = run_id.to_string();
        let tenant = tenant_id.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO approvals (approval_id, run_id, tenant_id, status, created_at)
                     VALUES (?1, ?2, ?3, 'PENDING', ?4)",
                    params![id, run, tenant, now_iso()],
                )?;
                Ok(())
            })
            .await?;
        Ok(approval_id)
    }

    pub async fn get(&self, tenant_id: &str, approval_id: &str) -> Result<Option<ApprovalRow>> {
        let tenant = tenant_id.to_string();
        let id = approval_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    &format!("{SELECT_APPROVAL} WHERE approval_id = ?1 AND tenant_id = ?2"),
                    params![id, tenant],
                    ApprovalRow::from_row,
                )
                .optional()
            })
            .await
    }

    pub async fn latest_for_run(&self, run_id: &str) -> Result<Option<ApprovalRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    &format!("{SELECT_APPROVAL} WHERE run_id = ?1 ORDER BY created_at DESC LIMIT 1"),
                    params![run],
                    ApprovalRow::from_row,
                )
                .optional()
            })
            .await
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<ApprovalRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn
                    .prepare_cached(&format!("{SELECT_APPROVAL} WHERE run_id = ?1 ORDER BY created_at ASC"))?;
                let rows = stmt
                    .query_map(params![run], ApprovalRow::from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    /// Complete a PENDING approval with a decision. Returns false when the
    /// approval was already decided.
    pub async fn decide(&self, approval_id: &str, decision: &str, decided_by: &str) -> Result<bool> {
        let id = approval_id.to_string();
        let decision = decision.to_string();
        let by = decided_by.to_string();
        let updated = self
            .db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE approvals SET status = 'COMPLETED', decision = ?1, decided_by = ?2, decided_at = ?3
                     WHERE approval_id = ?4 AND status = 'PENDING'",
                    params![decision, by, now_iso(), id],
                )
            })
            .await?;
        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::runs::RunsRepo;

    #[tokio::test]
    async fn test_decide_is_single_shot() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let runs = RunsRepo::new(db.clone());
        let run_id = runs.create("t_default", "PAPER", None, None).await.unwrap();
        let repo = ApprovalsRepo::new(db);
        let id = repo.create_pending(&run_id, "t_default").await.unwrap();
        assert!(repo.decide(&id, "APPROVED", "u_1").await.unwrap());
        assert!(!repo.decide(&id, "REJECTED", "u_2").await.unwrap());
        let row = repo.get("t_default", &id).await.unwrap().unwrap();
        assert_eq!(row.decision.as_deref(), Some("APPROVED"));
        assert_eq!(row.status, "COMPLETED");
    }
}
