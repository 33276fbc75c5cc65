//! DAG node rows. A run's nodes form a deterministic sequence; the runner
//! skips any node whose name is already COMPLETED for the run (resume).

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::db::Db;
use crate::ids::{new_id, now_iso};
use crate::state_machine::NodeStatus;

#[derive(Debug, Clone, Serialize)]
pub struct NodeRow {
    pub node_id: String,
    pub run_id: String,
    pub name: String,
    pub status: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub outputs_json: Option<String>,
    pub error_json: Option<String>,
}

impl NodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            node_id: row.get("node_id")?,
            run_id: row.get("run_id")?,
            name: row.get("name")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            outputs_json: row.get("outputs_json")?,
            error_json: row.get("error_json")?,
        })
    }
}

#[derive(Clone)]
pub struct NodesRepo {
    db: Db,
}

impl NodesRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert_running(&self, run_id: &str, name: &str) -> Result<String> {
        let node_id = new_id("node_");
        let id = node_id.clone();
        let run = run_id.to_string();
        let name = name.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO dag_nodes (node_id, run_id, name, status, started_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, run, name, NodeStatus::Running.as_str(), now_iso()],
                )?;
                Ok(())
            })
            .await?;
        Ok(node_id)
    }

    pub async fn complete(&self, node_id: &str, outputs_json: &str) -> Result<()> {
        let id = node_id.to_string();
        let outputs = outputs_json.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE dag_nodes SET status = ?1, completed_at = ?2, outputs_json = ?3
                     WHERE node_id = ?4",
                    params![NodeStatus::Completed.as_str(), now_iso(), outputs, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn fail(&self, node_id: &str, error_json: &str) -> Result<()> {
        let id = node_id.to_string();
        let error = error_json.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE dag_nodes SET status = ?1, completed_at = ?2, error_json = ?3
                     WHERE node_id = ?4",
                    params![NodeStatus::Failed.as_str(), now_iso(), error, id],
                )?;
                Ok(())
            })
            .await
    }

    /// True when a node with this name already completed on this run.
    pub async fn is_completed(&self, run_id: &str, name: &str) -> Result<bool> {
        let run = run_id.to_string();
        let name = name.to_string();
        let status: Option<String> = self
            .db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT status FROM dag_nodes WHERE run_id = ?1 AND name = ?2
                     ORDER BY started_at DESC LIMIT 1",
                    params![run, name],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(status.as_deref() == Some("COMPLETED"))
    }

    /// Latest outputs for a named node of the run, parsed as JSON.
    pub async fn outputs(&self, run_id: &str, name: &str) -> Result<Option<serde_json::Value>> {
        let run = run_id.to_string();
        let name = name.to_string();
        let raw: Option<Option<String>> = self
            .db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT outputs_json FROM dag_nodes WHERE run_id = ?1 AND name = ?2
                     ORDER BY started_at DESC LIMIT 1",
                    params![run, name],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(raw
            .flatten()
            .and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub async fn list(&self, run_id: &str) -> Result<Vec<NodeRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT node_id, run_id, name, status, started_at, completed_at, outputs_json, error_json
                     FROM dag_nodes WHERE run_id = ?1 ORDER BY started_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![run], NodeRow::from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn counts(&self, run_id: &str) -> Result<(i64, i64)> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM dag_nodes WHERE run_id = ?1",
                    params![run.clone()],
                    |r| r.get(0),
                )?;
                let done: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM dag_nodes WHERE run_id = ?1 AND status = 'COMPLETED'",
                    params![run.clone()],
                    |r| r.get(0),
                )?;
                Ok((total, done))
            })
            .await
    }

    pub async fn current_step(&self, run_id: &str) -> Result<Option<String>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT name FROM dag_nodes WHERE run_id = ?1 ORDER BY started_at DESC LIMIT 1",
                    params![run],
                    |r| r.get(0),
                )
                .optional()
            })
            .await
    }

    pub async fn last_error(&self, run_id: &str) -> Result<Option<String>> {
        let run = run_id.to_string();
        let raw: Option<Option<String>> = self
            .db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT error_json FROM dag_nodes WHERE run_id = ?1 AND status = 'FAILED'
                     ORDER BY completed_at DESC LIMIT 1",
                    params![run],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(raw.flatten().and_then(|s| {
            serde_json::from_str::<serde_json::Value>(&s)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::runs::RunsRepo;

    #[tokio::test]
    async fn test_node_lifecycle_and_resume_check() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let runs = RunsRepo::new(db.clone());
        let run_id = runs.create("t_default", "PAPER", None, None).await.unwrap();

        let repo = NodesRepo::new(db);
        assert!(!repo.is_completed(&run_id, "research").await.unwrap());
        let node_id = repo.insert_running(&run_id, "research").await.unwrap();
        repo.complete(&node_id, r#"{"returns_by_symbol":{}}"#).await.unwrap();
        assert!(repo.is_completed(&run_id, "research").await.unwrap());
        let outputs = repo.outputs(&run_id, "research").await.unwrap().unwrap();
        assert!(outputs.get("returns_by_symbol").is_some());

        let node2 = repo.insert_running(&run_id, "signals").await.unwrap();
        repo.fail(&node2, r#"{"error":"boom","error_code":null}"#).await.unwrap();
        assert_eq!(repo.last_error(&run_id).await.unwrap().as_deref(), Some("boom"));
        let (total, done) = repo.counts(&run_id).await.unwrap();
        assert_eq!((total, done), (2, 1));
    }
}
