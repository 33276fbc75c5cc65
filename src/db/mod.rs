//! SQLite persistence layer.
//!
//! One canonical database path is resolved per process; the connection is
//! opened once with WAL journaling, a 30 s busy timeout, and foreign-key
//! enforcement, then shared behind an async mutex (every unit of work is a
//! single critical section, so writers never interleave mid-transaction).
//! Schema is maintained by lexically ordered embedded migrations recorded
//! in `schema_migrations`.

pub mod approvals;
pub mod artifacts;
pub mod confirmations;
pub mod evals;
pub mod events;
pub mod evidence;
pub mod migrations;
pub mod nodes;
pub mod orders;
pub mod portfolio;
pub mod runs;
pub mod telemetry;

use anyhow::{Context, Result};
use rand::Rng;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const BUSY_TIMEOUT_MS: u32 = 30_000;
const BUSY_ERRORS: &[&str] = &["database is locked", "database table is locked"];

#[derive(Clone, Debug)]
pub struct Db {
    path: Arc<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at `db_path` and apply pragmas.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = canonical_db_path(db_path)?;
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create db dir {}", dir.display()))?;
            }
        }
        let conn = Connection::open(&path).context("open sqlite database")?;
        apply_pragmas(&conn)?;
        Ok(Self {
            path: Arc::new(path),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        apply_pragmas(&conn)?;
        Ok(Self {
            path: Arc::new(PathBuf::from(":memory:")),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the shared connection.
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().await;
        f(&conn).map_err(anyhow::Error::from)
    }

    /// Run `f` inside a single transaction; rolls back on error.
    pub async fn with_txn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().await;
        let txn = conn.unchecked_transaction()?;
        match f(&txn) {
            Ok(v) => {
                txn.commit()?;
                Ok(v)
            }
            Err(e) => Err(anyhow::Error::from(e)),
        }
    }

    /// `with_conn` with jittered exponential backoff on busy/locked errors
    /// (base 0.1 s, cap 2 s). Reads only; writers decide their own retry.
    pub async fn with_conn_retry<T>(
        &self,
        max_retries: u32,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let conn = self.conn.lock().await;
                f(&conn)
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let msg = e.to_string().to_lowercase();
                    let busy = BUSY_ERRORS.iter().any(|b| msg.contains(b));
                    if busy && attempt < max_retries {
                        let backoff = (0.1f64 * 2f64.powi(attempt as i32)
                            + rand::thread_rng().gen_range(0.0..0.05))
                        .min(2.0);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_s = backoff,
                            "database busy, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(anyhow::Error::from(e));
                }
            }
        }
    }

    /// Apply all pending migrations (idempotent).
    pub async fn init(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        migrations::apply_all(&conn)?;
        drop(conn);
        let (ok, missing) = self.validate_schema().await?;
        info!(
            db = %self.path.display(),
            schema_ok = ok,
            "database initialized"
        );
        let critical = critical_missing(&missing);
        if !critical.is_empty() {
            anyhow::bail!(
                "database schema is missing runner-critical columns: {:?}",
                critical
            );
        }
        Ok(())
    }

    /// Check the hardcoded table->columns contract. Returns `(ok, missing)`
    /// where `missing` maps table name to absent columns.
    pub async fn validate_schema(&self) -> Result<(bool, BTreeMap<String, Vec<String>>)> {
        let conn = self.conn.lock().await;
        let mut missing_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (table, expected) in REQUIRED_COLUMNS {
            let mut stmt = match conn.prepare(&format!("PRAGMA table_info({table})")) {
                Ok(s) => s,
                Err(_) => {
                    missing_map
                        .insert(table.to_string(), expected.iter().map(|c| c.to_string()).collect());
                    continue;
                }
            };
            let actual: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .filter_map(|r| r.ok())
                .collect();
            if actual.is_empty() {
                debug!(table, "schema validation: table does not exist");
                missing_map
                    .insert(table.to_string(), expected.iter().map(|c| c.to_string()).collect());
                continue;
            }
            let missing: Vec<String> = expected
                .iter()
                .filter(|c| !actual.iter().any(|a| a == *c))
                .map(|c| c.to_string())
                .collect();
            if !missing.is_empty() {
                warn!(table, ?missing, "schema validation: missing columns");
                missing_map.insert(table.to_string(), missing);
            }
        }
        Ok((missing_map.is_empty(), missing_map))
    }

    /// Applied and pending migration filenames plus schema health, for the
    /// health endpoint.
    pub async fn schema_status(&self) -> Result<SchemaStatus> {
        let applied: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT filename FROM schema_migrations ORDER BY filename ASC")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
            .unwrap_or_default();
        let pending: Vec<String> = migrations::MIGRATIONS
            .iter()
            .map(|(name, _)| name.to_string())
            .filter(|name| !applied.contains(name))
            .collect();
        let (schema_ok, missing_columns) = self.validate_schema().await?;
        Ok(SchemaStatus {
            db_path: self.path.display().to_string(),
            schema_ok,
            applied_migrations: applied,
            pending_migrations: pending,
            missing_columns,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchemaStatus {
    pub db_path: String,
    pub schema_ok: bool,
    pub applied_migrations: Vec<String>,
    pub pending_migrations: Vec<String>,
    pub missing_columns: BTreeMap<String, Vec<String>>,
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    // WAL fails on in-memory databases; best effort like the rest.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

fn canonical_db_path(db_path: &str) -> Result<PathBuf> {
    let p = PathBuf::from(db_path);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("resolve current dir")?;
    Ok(cwd.join(p))
}

/// Table -> columns contract checked by `validate_schema`.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "runs",
        &[
            "run_id", "tenant_id", "status", "execution_mode", "trace_id", "source_run_id",
            "created_at", "started_at", "completed_at", "command_text", "parsed_intent_json",
            "execution_plan_json", "trade_proposal_json", "metadata_json", "failure_reason",
            "failure_code", "locked_product_id", "tradability_verified", "news_enabled",
            "asset_class", "conversation_id",
        ],
    ),
    (
        "dag_nodes",
        &["node_id", "run_id", "name", "status", "started_at", "completed_at", "outputs_json", "error_json"],
    ),
    (
        "orders",
        &[
            "order_id", "run_id", "tenant_id", "provider", "symbol", "side", "order_type",
            "notional_usd", "qty", "status", "filled_qty", "avg_fill_price", "total_fees",
            "status_reason", "status_updated_at", "created_at",
        ],
    ),
    ("order_events", &["id", "order_id", "event_type", "payload_json", "ts"]),
    ("fills", &["fill_id", "order_id", "price", "size", "fee", "filled_at"]),
    (
        "trade_confirmations",
        &[
            "id", "tenant_id", "conversation_id", "user_id", "proposal_json", "insight_json",
            "mode", "status", "run_id", "created_at", "expires_at",
        ],
    ),
    ("run_events", &["event_id", "run_id", "tenant_id", "event_type", "payload_json", "ts"]),
    ("run_artifacts", &["run_id", "step_name", "artifact_type", "artifact_json", "created_at"]),
    (
        "portfolio_snapshots",
        &["snapshot_id", "run_id", "tenant_id", "balances_json", "positions_json", "total_value_usd", "ts"],
    ),
    (
        "tool_calls",
        &["id", "run_id", "node_id", "tool_name", "request_json", "response_json", "status", "error_text", "ts"],
    ),
    ("policy_events", &["id", "run_id", "node_id", "decision", "reasons_json", "ts"]),
    (
        "approvals",
        &["approval_id", "run_id", "tenant_id", "status", "decision", "decided_by", "decided_at"],
    ),
    (
        "eval_results",
        &[
            "eval_id", "run_id", "tenant_id", "conversation_id", "eval_name", "score",
            "reasons_json", "step_name", "eval_category", "evaluator_type", "thresholds_json", "ts",
        ],
    ),
    (
        "market_candles_batches",
        &["batch_id", "run_id", "symbol", "window", "candles_json", "query_params_json", "ts"],
    ),
    (
        "rankings",
        &["ranking_id", "run_id", "node_id", "window", "metric", "selected_symbol", "selected_score", "table_json", "ts"],
    ),
    ("run_news_evidence", &["run_id", "item_id", "role"]),
    ("news_items", &["id", "source_id", "published_at", "title", "url", "content_hash"]),
    ("news_asset_mentions", &["item_id", "asset_symbol", "confidence"]),
    ("tenants", &["tenant_id", "kill_switch_enabled"]),
    (
        "run_telemetry",
        &["run_id", "tenant_id", "started_at", "ended_at", "duration_ms", "tool_calls_count", "sse_events_count", "error_count", "last_error", "trace_id"],
    ),
    ("trade_tickets", &["id", "run_id", "tenant_id", "status", "ticket_json"]),
];

/// Runner-critical columns: startup fails fast when any of these is absent.
fn critical_missing(missing: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    const CRITICAL: &[(&str, &str)] = &[
        ("runs", "command_text"),
        ("runs", "news_enabled"),
        ("runs", "asset_class"),
        ("dag_nodes", "error_json"),
    ];
    CRITICAL
        .iter()
        .filter(|(table, col)| {
            missing
                .get(*table)
                .map(|cols| cols.iter().any(|c| c == col))
                .unwrap_or(false)
        })
        .map(|(table, col)| format!("{table}.{col}"))
        .collect()
}

/// Classify an error as a transient SQLite busy condition.
pub fn is_busy_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    BUSY_ERRORS.iter().any(|b| msg.contains(b))
}

/// Classify an error as a schema mismatch (missing table/column).
pub fn is_schema_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("no such table") || msg.contains("no such column")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_then_schema_ok() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let (ok, missing) = db.validate_schema().await.unwrap();
        assert!(ok, "schema should validate after init: {missing:?}");
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        db.init().await.unwrap();
        let status = db.schema_status().await.unwrap();
        assert!(status.pending_migrations.is_empty());
        assert_eq!(
            status.applied_migrations.len(),
            migrations::MIGRATIONS.len()
        );
    }

    #[tokio::test]
    async fn test_validate_schema_reports_missing_table() {
        let db = Db::open_in_memory().unwrap();
        // No migrations applied: everything is missing.
        let (ok, missing) = db.validate_schema().await.unwrap();
        assert!(!ok);
        assert!(missing.contains_key("runs"));
    }

    #[tokio::test]
    async fn test_txn_rolls_back_on_error() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let res = db
            .with_txn(|conn| {
                conn.execute(
                    "INSERT INTO tenants (tenant_id, kill_switch_enabled) VALUES ('t_x', 0)",
                    [],
                )?;
                // Duplicate primary key forces the error path.
                conn.execute(
                    "INSERT INTO tenants (tenant_id, kill_switch_enabled) VALUES ('t_x', 0)",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(res.is_err());
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM tenants WHERE tenant_id = 't_x'", [], |r| {
                    r.get(0)
                })
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
