//! Runs repository. `update_status` is the only writer of `runs.status`
//! and validates every transition against the state machine inside the
//! same transaction that reads the current value.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::Db;
use crate::ids::{new_id, now_iso};
use crate::state_machine::{can_transition, RunStatus};

#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    pub run_id: String,
    pub tenant_id: String,
    pub status: String,
    pub execution_mode: String,
    pub trace_id: Option<String>,
    pub source_run_id: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub command_text: Option<String>,
    pub parsed_intent_json: Option<String>,
    pub execution_plan_json: Option<String>,
    pub trade_proposal_json: Option<String>,
    pub metadata_json: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_code: Option<String>,
    pub locked_product_id: Option<String>,
    pub tradability_verified: bool,
    pub news_enabled: bool,
    pub asset_class: String,
    pub conversation_id: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get("run_id")?,
            tenant_id: row.get("tenant_id")?,
            status: row.get("status")?,
            execution_mode: row.get("execution_mode")?,
            trace_id: row.get("trace_id")?,
            source_run_id: row.get("source_run_id")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            command_text: row.get("command_text")?,
            parsed_intent_json: row.get("parsed_intent_json")?,
            execution_plan_json: row.get("execution_plan_json")?,
            trade_proposal_json: row.get("trade_proposal_json")?,
            metadata_json: row.get("metadata_json")?,
            failure_reason: row.get("failure_reason")?,
            failure_code: row.get("failure_code")?,
            locked_product_id: row.get("locked_product_id")?,
            tradability_verified: row.get::<_, i64>("tradability_verified")? != 0,
            news_enabled: row.get::<_, Option<i64>>("news_enabled")?.map(|v| v != 0).unwrap_or(true),
            asset_class: row.get::<_, Option<String>>("asset_class")?.unwrap_or_else(|| "CRYPTO".to_string()),
            conversation_id: row.get("conversation_id")?,
        })
    }

    pub fn status_enum(&self) -> Option<RunStatus> {
        RunStatus::parse(&self.status)
    }
}

const SELECT_RUN: &str = "SELECT run_id, tenant_id, status, execution_mode, trace_id, source_run_id, \
     created_at, started_at, completed_at, command_text, parsed_intent_json, \
     execution_plan_json, trade_proposal_json, metadata_json, failure_reason, \
     failure_code, locked_product_id, tradability_verified, news_enabled, \
     asset_class, conversation_id FROM runs";

#[derive(Clone)]
pub struct RunsRepo {
    db: Db,
}

impl RunsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a run in `CREATED` with a fresh trace id.
    pub async fn create(
        &self,
        tenant_id: &str,
        execution_mode: &str,
        source_run_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<String> {
        let run_id = new_id("run_");
        let trace_id = new_id("trace_");
        let tenant = tenant_id.to_string();
        let mode = execution_mode.to_string();
        let source = source_run_id.map(|s| s.to_string());
        let conv = conversation_id.map(|s| s.to_string());
        let id = run_id.clone();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO tenants (tenant_id, kill_switch_enabled, created_at) VALUES (?1, 0, ?2)",
                    params![tenant, now_iso()],
                )?;
                conn.execute(
                    "INSERT INTO runs (run_id, tenant_id, status, execution_mode, trace_id, source_run_id, created_at, conversation_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![id, tenant, RunStatus::Created.as_str(), mode, trace_id, source, now_iso(), conv],
                )?;
                Ok(())
            })
            .await?;
        debug!(run_id = %run_id, mode = %execution_mode, tenant = %tenant_id, "created run");
        Ok(run_id)
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<RunRow>> {
        let id = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    &format!("{SELECT_RUN} WHERE run_id = ?1"),
                    params![id],
                    RunRow::from_row,
                )
                .optional()
            })
            .await
    }

    pub async fn get_scoped(&self, tenant_id: &str, run_id: &str) -> Result<Option<RunRow>> {
        let id = run_id.to_string();
        let tenant = tenant_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    &format!("{SELECT_RUN} WHERE run_id = ?1 AND tenant_id = ?2"),
                    params![id, tenant],
                    RunRow::from_row,
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self, tenant_id: &str, limit: i64) -> Result<Vec<RunRow>> {
        let tenant = tenant_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "{SELECT_RUN} WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![tenant, limit], RunRow::from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    /// Validated status transition. Terminal-state re-entry is a silent
    /// no-op; other invalid transitions are logged and skipped.
    pub async fn update_status(
        &self,
        run_id: &str,
        next: RunStatus,
        started_at: Option<String>,
        completed_at: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        let id = run_id.to_string();
        self.db
            .with_txn(move |conn| {
                let current: Option<String> = conn
                    .query_row("SELECT status FROM runs WHERE run_id = ?1", params![id], |r| {
                        r.get(0)
                    })
                    .optional()?;
                let Some(current_str) = current else {
                    return Ok(());
                };
                if let Some(current) = RunStatus::parse(&current_str) {
                    if !can_transition(current, next) {
                        if current.is_terminal() {
                            debug!(run_id = %id, from = %current, to = %next, "skipping no-op transition (already terminal)");
                        } else {
                            warn!(run_id = %id, from = %current, to = %next, "invalid run transition; skipping to preserve state integrity");
                        }
                        return Ok(());
                    }
                }
                apply_status_update(conn, &id, next, started_at.as_deref(), completed_at.as_deref(), error.as_deref())
            })
            .await
    }

    pub async fn set_trade_fields(
        &self,
        run_id: &str,
        command_text: &str,
        metadata_json: &str,
        parsed_intent_json: &str,
        execution_plan_json: &str,
        news_enabled: bool,
        asset_class: &str,
        locked_product_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<()> {
        let id = run_id.to_string();
        let command = command_text.to_string();
        let metadata = metadata_json.to_string();
        let intent = parsed_intent_json.to_string();
        let plan = execution_plan_json.to_string();
        let class = asset_class.to_string();
        let locked = locked_product_id.map(|s| s.to_string());
        let conv = conversation_id.map(|s| s.to_string());
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE runs SET command_text = ?1, metadata_json = ?2, parsed_intent_json = ?3,
                        execution_plan_json = ?4, news_enabled = ?5, asset_class = ?6,
                        locked_product_id = ?7, tradability_verified = ?8,
                        conversation_id = COALESCE(?9, conversation_id)
                     WHERE run_id = ?10",
                    params![
                        command,
                        metadata,
                        intent,
                        plan,
                        news_enabled as i64,
                        class,
                        locked,
                        locked.is_some() as i64,
                        conv,
                        id
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_execution_plan(&self, run_id: &str, plan_json: &str) -> Result<()> {
        let id = run_id.to_string();
        let plan = plan_json.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE runs SET execution_plan_json = ?1 WHERE run_id = ?2",
                    params![plan, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_trade_proposal(&self, run_id: &str, proposal_json: &str) -> Result<()> {
        let id = run_id.to_string();
        let proposal = proposal_json.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE runs SET trade_proposal_json = ?1 WHERE run_id = ?2",
                    params![proposal, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_failure(&self, run_id: &str, reason: &str, code: Option<&str>) -> Result<()> {
        let id = run_id.to_string();
        let reason = reason.to_string();
        let code = code.map(|s| s.to_string());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE runs SET failure_reason = ?1, failure_code = ?2 WHERE run_id = ?3",
                    params![reason, code, id],
                )?;
                Ok(())
            })
            .await
    }

    /// First active (`CREATED`/`RUNNING`) run for the tenant, scoped to a
    /// conversation when one is known.
    pub async fn find_active(
        &self,
        tenant_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Option<String>> {
        let tenant = tenant_id.to_string();
        let conv = conversation_id.map(|s| s.to_string());
        self.db
            .with_conn_retry(3, move |conn| {
                match &conv {
                    Some(conv_id) => conn
                        .query_row(
                            "SELECT run_id FROM runs WHERE tenant_id = ?1 AND conversation_id = ?2
                               AND status IN ('CREATED', 'RUNNING') LIMIT 1",
                            params![tenant, conv_id],
                            |r| r.get(0),
                        )
                        .optional(),
                    None => conn
                        .query_row(
                            "SELECT run_id FROM runs WHERE tenant_id = ?1
                               AND status IN ('CREATED', 'RUNNING') LIMIT 1",
                            params![tenant],
                            |r| r.get(0),
                        )
                        .optional(),
                }
            })
            .await
    }

    pub async fn tenant_kill_switch(&self, tenant_id: &str) -> Result<bool> {
        let tenant = tenant_id.to_string();
        let flag: Option<i64> = self
            .db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT kill_switch_enabled FROM tenants WHERE tenant_id = ?1",
                    params![tenant],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(flag.unwrap_or(0) != 0)
    }

    pub async fn set_tenant_kill_switch(&self, tenant_id: &str, enabled: bool) -> Result<()> {
        let tenant = tenant_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO tenants (tenant_id, kill_switch_enabled, created_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(tenant_id) DO UPDATE SET kill_switch_enabled = excluded.kill_switch_enabled",
                    params![tenant, enabled as i64, now_iso()],
                )?;
                Ok(())
            })
            .await
    }
}

fn apply_status_update(
    conn: &Connection,
    run_id: &str,
    next: RunStatus,
    started_at: Option<&str>,
    completed_at: Option<&str>,
    error: Option<&str>,
) -> rusqlite::Result<()> {
    if let Some(started) = started_at {
        conn.execute(
            "UPDATE runs SET status = ?1, started_at = ?2 WHERE run_id = ?3",
            params![next.as_str(), started, run_id],
        )?;
    } else if let Some(completed) = completed_at {
        conn.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2 WHERE run_id = ?3",
            params![next.as_str(), completed, run_id],
        )?;
    } else if let Some(err) = error {
        conn.execute(
            "UPDATE runs SET status = ?1, failure_reason = ?2 WHERE run_id = ?3",
            params![next.as_str(), err, run_id],
        )?;
    } else {
        conn.execute(
            "UPDATE runs SET status = ?1 WHERE run_id = ?2",
            params![next.as_str(), run_id],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = RunsRepo::new(test_db().await);
        let run_id = repo.create("t_default", "PAPER", None, None).await.unwrap();
        let run = repo.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "CREATED");
        assert_eq!(run.execution_mode, "PAPER");
        assert!(run.trace_id.unwrap().starts_with("trace_"));
        assert!(run.news_enabled);
    }

    #[tokio::test]
    async fn test_terminal_status_is_sink() {
        let repo = RunsRepo::new(test_db().await);
        let run_id = repo.create("t_default", "PAPER", None, None).await.unwrap();
        repo.update_status(&run_id, RunStatus::Running, Some(now_iso()), None, None)
            .await
            .unwrap();
        repo.update_status(&run_id, RunStatus::Completed, None, Some(now_iso()), None)
            .await
            .unwrap();
        // Attempt to fail a completed run: idempotent skip.
        repo.update_status(&run_id, RunStatus::Failed, None, None, Some("late".into()))
            .await
            .unwrap();
        let run = repo.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "COMPLETED");
    }

    #[tokio::test]
    async fn test_invalid_transition_skipped() {
        let repo = RunsRepo::new(test_db().await);
        let run_id = repo.create("t_default", "PAPER", None, None).await.unwrap();
        // CREATED -> COMPLETED is not legal; status must stay CREATED.
        repo.update_status(&run_id, RunStatus::Completed, None, Some(now_iso()), None)
            .await
            .unwrap();
        let run = repo.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "CREATED");
    }

    #[tokio::test]
    async fn test_active_run_guard_scoped_by_conversation() {
        let repo = RunsRepo::new(test_db().await);
        let run_id = repo
            .create("t_default", "PAPER", None, Some("conv_1"))
            .await
            .unwrap();
        assert_eq!(
            repo.find_active("t_default", Some("conv_1")).await.unwrap(),
            Some(run_id.clone())
        );
        assert_eq!(repo.find_active("t_default", Some("conv_2")).await.unwrap(), None);
        // Tenant-wide fallback sees it regardless of conversation.
        assert!(repo.find_active("t_default", None).await.unwrap().is_some());
    }
}
