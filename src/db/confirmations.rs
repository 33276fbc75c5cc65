//! Trade confirmations repository.
//!
//! The conditional `UPDATE ... WHERE status = 'PENDING'` in
//! `mark_confirmed` is the single arbiter that prevents double execution:
//! exactly one concurrent confirm observes `rowcount = 1`.

use anyhow::Result;
use chrono::Duration;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::db::Db;
use crate::ids::{new_id, now_iso};
use crate::state_machine::ConfirmationStatus;

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRow {
    pub id: String,
    pub tenant_id: String,
    pub conversation_id: Option<String>,
    pub user_id: String,
    pub proposal_json: String,
    pub insight_json: Option<String>,
    pub mode: String,
    pub status: String,
    pub run_id: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

impl ConfirmationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            conversation_id: row.get("conversation_id")?,
            user_id: row.get("user_id")?,
            proposal_json: row.get("proposal_json")?,
            insight_json: row.get("insight_json")?,
            mode: row.get("mode")?,
            status: row.get("status")?,
            run_id: row.get("run_id")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
        })
    }

    pub fn is_expired_now(&self) -> bool {
        now_iso() > self.expires_at
    }
}

#[derive(Clone)]
pub struct ConfirmationsRepo {
    db: Db,
}

impl ConfirmationsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Persist a PENDING confirmation with a TTL. Returns the `conf_` id.
    pub async fn create_pending(
        &self,
        tenant_id: &str,
        user_id: &str,
        conversation_id: Option<&str>,
        proposal_json: &str,
        insight_json: Option<&str>,
        mode: &str,
        ttl_seconds: i64,
    ) -> Result<String> {
        let id = new_id("conf_");
        let expires_at = (Utc::now() + Duration::seconds(ttl_seconds))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let tenant = tenant_id.to_string();
        let user = user_id.to_string();
        let conv = conversation_id.map(|s| s.to_string());
        let proposal = proposal_json.to_string();
        let insight = insight_json.map(|s| s.to_string());
        let mode = mode.to_string();
        let conf_id = id.clone();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO trade_confirmations
                        (id, tenant_id, conversation_id, user_id, proposal_json, insight_json,
                         mode, status, run_id, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10)",
                    params![
                        conf_id,
                        tenant,
                        conv,
                        user,
                        proposal,
                        insight,
                        mode,
                        ConfirmationStatus::Pending.as_str(),
                        now_iso(),
                        expires_at
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn get(&self, tenant_id: &str, confirmation_id: &str) -> Result<Option<ConfirmationRow>> {
        let tenant = tenant_id.to_string();
        let id = confirmation_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT id, tenant_id, conversation_id, user_id, proposal_json, insight_json,
                            mode, status, run_id, created_at, expires_at
                     FROM trade_confirmations WHERE id = ?1 AND tenant_id = ?2",
                    params![id, tenant],
                    ConfirmationRow::from_row,
                )
                .optional()
            })
            .await
    }

    /// Atomic single-use transition PENDING -> CONFIRMED. Returns true when
    /// this caller won the update.
    pub async fn mark_confirmed(&self, tenant_id: &str, confirmation_id: &str) -> Result<bool> {
        let tenant = tenant_id.to_string();
        let id = confirmation_id.to_string();
        let updated = self
            .db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE trade_confirmations SET status = 'CONFIRMED'
                     WHERE id = ?1 AND tenant_id = ?2 AND status = 'PENDING'",
                    params![id, tenant],
                )
            })
            .await?;
        Ok(updated == 1)
    }

    pub async fn mark_cancelled(&self, tenant_id: &str, confirmation_id: &str) -> Result<bool> {
        let tenant = tenant_id.to_string();
        let id = confirmation_id.to_string();
        let updated = self
            .db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE trade_confirmations SET status = 'CANCELLED'
                     WHERE id = ?1 AND tenant_id = ?2 AND status = 'PENDING'",
                    params![id, tenant],
                )
            })
            .await?;
        Ok(updated == 1)
    }

    pub async fn mark_expired(&self, tenant_id: &str, confirmation_id: &str) -> Result<bool> {
        let tenant = tenant_id.to_string();
        let id = confirmation_id.to_string();
        let updated = self
            .db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE trade_confirmations SET status = 'EXPIRED'
                     WHERE id = ?1 AND tenant_id = ?2 AND status = 'PENDING'",
                    params![id, tenant],
                )
            })
            .await?;
        Ok(updated == 1)
    }

    /// Set the run back-pointer. Written once, during the winning confirm.
    pub async fn set_run_id(&self, tenant_id: &str, confirmation_id: &str, run_id: &str) -> Result<()> {
        let tenant = tenant_id.to_string();
        let id = confirmation_id.to_string();
        let run = run_id.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE trade_confirmations SET run_id = ?1
                     WHERE id = ?2 AND tenant_id = ?3 AND run_id IS NULL",
                    params![run, id, tenant],
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> ConfirmationsRepo {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        ConfirmationsRepo::new(db)
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let repo = repo().await;
        let id = repo
            .create_pending("t_default", "u_1", Some("conv_1"), "{}", None, "PAPER", 300)
            .await
            .unwrap();
        assert!(id.starts_with("conf_"));
        let row = repo.get("t_default", &id).await.unwrap().unwrap();
        assert_eq!(row.status, "PENDING");
        assert!(row.run_id.is_none());
        assert!(!row.is_expired_now());
        // Wrong tenant does not see it.
        assert!(repo.get("t_other", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_confirmed_single_use() {
        let repo = repo().await;
        let id = repo
            .create_pending("t_default", "u_1", None, "{}", None, "PAPER", 300)
            .await
            .unwrap();
        assert!(repo.mark_confirmed("t_default", &id).await.unwrap());
        // Second attempt loses.
        assert!(!repo.mark_confirmed("t_default", &id).await.unwrap());
        // Terminal states reject cancel too.
        assert!(!repo.mark_cancelled("t_default", &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_id_written_once() {
        let repo = repo().await;
        let id = repo
            .create_pending("t_default", "u_1", None, "{}", None, "PAPER", 300)
            .await
            .unwrap();
        repo.set_run_id("t_default", &id, "run_a").await.unwrap();
        repo.set_run_id("t_default", &id, "run_b").await.unwrap();
        let row = repo.get("t_default", &id).await.unwrap().unwrap();
        assert_eq!(row.run_id.as_deref(), Some("run_a"));
    }

    #[tokio::test]
    async fn test_ttl_expiry_detection() {
        let repo = repo().await;
        let id = repo
            .create_pending("t_default", "u_1", None, "{}", None, "PAPER", -5)
            .await
            .unwrap();
        let row = repo.get("t_default", &id).await.unwrap().unwrap();
        assert!(row.is_expired_now());
        assert!(repo.mark_expired("t_default", &id).await.unwrap());
    }
}
