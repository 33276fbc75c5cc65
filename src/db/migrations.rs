//! Embedded schema migrations, applied in lexical filename order.
//!
//! Each migration is split on `;` and executed statement by statement so a
//! partially applied file can be re-run: `duplicate column` and `already
//! exists` errors count as success. Applied filenames are recorded in
//! `schema_migrations`.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::ids::now_iso;

pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_core.sql", MIGRATION_001),
    ("002_evidence.sql", MIGRATION_002),
    ("003_telemetry.sql", MIGRATION_003),
    ("004_indexes.sql", MIGRATION_004),
];

const BOOTSTRAP: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL
)";

/// Apply every migration that is not yet recorded.
pub fn apply_all(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(BOOTSTRAP, [])?;

    let applied: Vec<String> = {
        let mut stmt = conn.prepare("SELECT filename FROM schema_migrations")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };

    for (filename, sql) in MIGRATIONS {
        if applied.iter().any(|a| a == filename) {
            debug!(migration = filename, "already applied, skipping");
            continue;
        }
        let (executed, skipped) = apply_one(conn, sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (filename, applied_at) VALUES (?1, ?2)",
            rusqlite::params![filename, now_iso()],
        )?;
        if skipped > 0 {
            info!(migration = filename, executed, skipped, "applied migration (partial overlap)");
        } else {
            info!(migration = filename, executed, "applied migration");
        }
    }
    Ok(())
}

/// Execute one migration statement-by-statement, tolerating statements
/// whose objects already exist.
fn apply_one(conn: &Connection, sql: &str) -> anyhow::Result<(usize, usize)> {
    let mut executed = 0usize;
    let mut skipped = 0usize;
    for statement in split_statements(sql) {
        match conn.execute(&statement, []) {
            Ok(_) => executed += 1,
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("duplicate column") || msg.contains("already exists") {
                    skipped += 1;
                } else {
                    return Err(anyhow::anyhow!("migration statement failed: {e} -- {statement}"));
                }
            }
        }
    }
    Ok((executed, skipped))
}

/// Strip `--` comments and split on `;`, dropping empty fragments.
fn split_statements(sql: &str) -> Vec<String> {
    let cleaned: String = sql
        .lines()
        .map(|line| match line.find("--") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n");
    cleaned
        .split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

const MIGRATION_001: &str = r#"
-- Core entities: tenants, runs, nodes, events, artifacts, orders,
-- confirmations, snapshots, approvals, policy events, tool calls, evals.

CREATE TABLE IF NOT EXISTS tenants (
    tenant_id TEXT PRIMARY KEY,
    kill_switch_enabled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT
);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    execution_mode TEXT NOT NULL,
    trace_id TEXT,
    source_run_id TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    command_text TEXT,
    parsed_intent_json TEXT,
    execution_plan_json TEXT,
    trade_proposal_json TEXT,
    metadata_json TEXT,
    failure_reason TEXT,
    failure_code TEXT,
    locked_product_id TEXT,
    tradability_verified INTEGER NOT NULL DEFAULT 0,
    news_enabled INTEGER NOT NULL DEFAULT 1,
    asset_class TEXT NOT NULL DEFAULT 'CRYPTO'
);

CREATE TABLE IF NOT EXISTS dag_nodes (
    node_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    inputs_json TEXT,
    outputs_json TEXT,
    error_json TEXT
);

CREATE TABLE IF NOT EXISTS run_events (
    event_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    step_name TEXT NOT NULL,
    artifact_type TEXT NOT NULL,
    artifact_json TEXT NOT NULL,
    created_at TEXT
);

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL DEFAULT 'MARKET',
    notional_usd REAL NOT NULL,
    qty REAL,
    status TEXT NOT NULL,
    filled_qty REAL,
    avg_fill_price REAL,
    total_fees REAL,
    status_reason TEXT,
    status_updated_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS order_events (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fills (
    fill_id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    price REAL NOT NULL,
    size REAL NOT NULL,
    fee REAL NOT NULL DEFAULT 0,
    filled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trade_confirmations (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    conversation_id TEXT,
    user_id TEXT NOT NULL,
    proposal_json TEXT NOT NULL,
    insight_json TEXT,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    run_id TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS portfolio_snapshots (
    snapshot_id TEXT PRIMARY KEY,
    run_id TEXT,
    tenant_id TEXT NOT NULL,
    balances_json TEXT NOT NULL,
    positions_json TEXT NOT NULL,
    total_value_usd REAL NOT NULL,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tool_calls (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    node_id TEXT,
    tool_name TEXT NOT NULL,
    request_json TEXT,
    response_json TEXT,
    status TEXT NOT NULL,
    error_text TEXT,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS policy_events (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    node_id TEXT,
    decision TEXT NOT NULL,
    reasons_json TEXT NOT NULL,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS approvals (
    approval_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    decision TEXT,
    decided_by TEXT,
    decided_at TEXT,
    created_at TEXT
);

CREATE TABLE IF NOT EXISTS eval_results (
    eval_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    conversation_id TEXT,
    eval_name TEXT NOT NULL,
    score REAL NOT NULL,
    reasons_json TEXT NOT NULL,
    step_name TEXT,
    eval_category TEXT NOT NULL,
    evaluator_type TEXT NOT NULL DEFAULT 'heuristic',
    thresholds_json TEXT,
    ts TEXT NOT NULL
);
"#;

const MIGRATION_002: &str = r#"
-- Run evidence: candle batches (the sole replay source of truth),
-- rankings, news items and per-run news evidence links.

CREATE TABLE IF NOT EXISTS market_candles_batches (
    batch_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    symbol TEXT NOT NULL,
    window TEXT NOT NULL,
    candles_json TEXT NOT NULL,
    query_params_json TEXT,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rankings (
    ranking_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    node_id TEXT,
    window TEXT NOT NULL,
    metric TEXT NOT NULL,
    selected_symbol TEXT,
    selected_score REAL,
    table_json TEXT NOT NULL,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS news_sources (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    url TEXT,
    is_enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS news_items (
    id TEXT PRIMARY KEY,
    source_id TEXT,
    published_at TEXT NOT NULL,
    title TEXT NOT NULL,
    url TEXT,
    content_hash TEXT
);

CREATE TABLE IF NOT EXISTS news_asset_mentions (
    item_id TEXT NOT NULL,
    asset_symbol TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    PRIMARY KEY (item_id, asset_symbol)
);

CREATE TABLE IF NOT EXISTS run_news_evidence (
    run_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'context',
    PRIMARY KEY (run_id, item_id)
);
"#;

const MIGRATION_003: &str = r#"
-- Per-run telemetry rollup and assisted-live order tickets.

CREATE TABLE IF NOT EXISTS run_telemetry (
    run_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    duration_ms INTEGER,
    tool_calls_count INTEGER NOT NULL DEFAULT 0,
    sse_events_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    trace_id TEXT,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS trade_tickets (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    ticket_json TEXT NOT NULL,
    created_at TEXT
);
"#;

const MIGRATION_004: &str = r#"
-- Conversation linkage on runs plus hot-path indexes.

ALTER TABLE runs ADD COLUMN conversation_id TEXT;

CREATE INDEX IF NOT EXISTS idx_runs_tenant_created ON runs(tenant_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_tenant_status ON runs(tenant_id, status);
CREATE INDEX IF NOT EXISTS idx_run_events_run_ts ON run_events(run_id, ts ASC);
CREATE INDEX IF NOT EXISTS idx_dag_nodes_run ON dag_nodes(run_id, started_at ASC);
CREATE INDEX IF NOT EXISTS idx_orders_run ON orders(run_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_orders_tenant_created ON orders(tenant_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_artifacts_run_type ON run_artifacts(run_id, artifact_type);
CREATE INDEX IF NOT EXISTS idx_snapshots_tenant_ts ON portfolio_snapshots(tenant_id, ts DESC);
CREATE INDEX IF NOT EXISTS idx_candles_run ON market_candles_batches(run_id);
CREATE INDEX IF NOT EXISTS idx_news_mentions_asset ON news_asset_mentions(asset_symbol);
CREATE INDEX IF NOT EXISTS idx_tool_calls_run ON tool_calls(run_id);
CREATE INDEX IF NOT EXISTS idx_eval_results_run ON eval_results(run_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_lexically_ordered() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|(n, _)| *n).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_split_statements_strips_comments() {
        let stmts = split_statements("-- header\nCREATE TABLE a (x); -- trailing\nCREATE TABLE b (y);\n");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE a"));
    }

    #[test]
    fn test_reapply_tolerates_existing_objects() {
        let conn = Connection::open_in_memory().unwrap();
        apply_all(&conn).unwrap();
        // Wipe the ledger but keep the tables: re-apply must succeed by
        // skipping duplicate-object errors.
        conn.execute("DELETE FROM schema_migrations", []).unwrap();
        apply_all(&conn).unwrap();
    }
}
