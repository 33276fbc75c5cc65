//! Run artifacts, indexed by `(run_id, artifact_type)`.
//!
//! Stored as opaque JSON strings; readers parse at the edge and fall back
//! to `null` on corrupt rows instead of failing a whole listing.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::warn;

use crate::db::Db;
use crate::ids::now_iso;

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRow {
    pub run_id: String,
    pub step_name: String,
    pub artifact_type: String,
    pub artifact_json: serde_json::Value,
    pub created_at: Option<String>,
}

#[derive(Clone)]
pub struct ArtifactsRepo {
    db: Db,
}

impl ArtifactsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert(
        &self,
        run_id: &str,
        step_name: &str,
        artifact_type: &str,
        artifact: &serde_json::Value,
    ) -> Result<()> {
        let run = run_id.to_string();
        let step = step_name.to_string();
        let kind = artifact_type.to_string();
        let json = artifact.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO run_artifacts (run_id, step_name, artifact_type, artifact_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![run, step, kind, json, now_iso()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_latest(
        &self,
        run_id: &str,
        artifact_type: &str,
    ) -> Result<Option<serde_json::Value>> {
        let run = run_id.to_string();
        let kind = artifact_type.to_string();
        let raw: Option<String> = self
            .db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT artifact_json FROM run_artifacts
                     WHERE run_id = ?1 AND artifact_type = ?2
                     ORDER BY id DESC LIMIT 1",
                    params![run, kind],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(raw.and_then(|s| match serde_json::from_str(&s) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(run_id, artifact_type, error = %e, "corrupt artifact json; returning none");
                None
            }
        }))
    }

    pub async fn list(&self, run_id: &str) -> Result<Vec<ArtifactRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT run_id, step_name, artifact_type, artifact_json, created_at
                     FROM run_artifacts WHERE run_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(params![run], |r| {
                        let raw: String = r.get(3)?;
                        Ok(ArtifactRow {
                            run_id: r.get(0)?,
                            step_name: r.get(1)?,
                            artifact_type: r.get(2)?,
                            artifact_json: serde_json::from_str(&raw)
                                .unwrap_or(serde_json::Value::Null),
                            created_at: r.get(4)?,
                        })
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    /// Evidence refs for the receipt: artifact types recorded by execution.
    pub async fn evidence_refs(&self, run_id: &str) -> Result<Vec<serde_json::Value>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT artifact_type, step_name FROM run_artifacts
                     WHERE run_id = ?1 AND artifact_type IN ('order_response', 'provider_order', 'order_ticket')",
                )?;
                let rows = stmt
                    .query_map(params![run], |r| {
                        Ok(serde_json::json!({
                            "type": r.get::<_, String>(0)?,
                            "step": r.get::<_, String>(1)?,
                        }))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn count(&self, run_id: &str) -> Result<i64> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM run_artifacts WHERE run_id = ?1",
                    params![run],
                    |r| r.get(0),
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::runs::RunsRepo;

    #[tokio::test]
    async fn test_corrupt_artifact_returns_none_not_error() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let runs = RunsRepo::new(db.clone());
        let run_id = runs.create("t_default", "PAPER", None, None).await.unwrap();
        let run = run_id.clone();
        db.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO run_artifacts (run_id, step_name, artifact_type, artifact_json)
                 VALUES (?1, 'x', 'trade_receipt', 'not-json')",
                params![run],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        let repo = ArtifactsRepo::new(db);
        assert!(repo.get_latest(&run_id, "trade_receipt").await.unwrap().is_none());
        // Listing still returns the row, with a null payload.
        let rows = repo.list(&run_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].artifact_json.is_null());
    }
}
