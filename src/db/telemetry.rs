//! Per-run telemetry rollup (duration, tool-call and event counts).

use anyhow::Result;
use rusqlite::params;

use crate::db::Db;
use crate::ids::now_iso;

#[derive(Debug, Clone, Default)]
pub struct TelemetryUpdate {
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub tool_calls_count: Option<i64>,
    pub sse_events_count: Option<i64>,
    pub error_count: Option<i64>,
    pub last_error: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Clone)]
pub struct TelemetryRepo {
    db: Db,
}

impl TelemetryRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, run_id: &str, tenant_id: &str, update: TelemetryUpdate) -> Result<()> {
        let run = run_id.to_string();
        let tenant = tenant_id.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO run_telemetry (run_id, tenant_id, started_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(run_id) DO NOTHING",
                    params![run, tenant, update.started_at, now_iso()],
                )?;
                conn.execute(
                    "UPDATE run_telemetry SET
                        started_at = COALESCE(?1, started_at),
                        ended_at = COALESCE(?2, ended_at),
                        duration_ms = COALESCE(?3, duration_ms),
                        tool_calls_count = COALESCE(?4, tool_calls_count),
                        sse_events_count = COALESCE(?5, sse_events_count),
                        error_count = COALESCE(?6, error_count),
                        last_error = COALESCE(?7, last_error),
                        trace_id = COALESCE(?8, trace_id),
                        updated_at = ?9
                     WHERE run_id = ?10",
                    params![
                        update.started_at,
                        update.ended_at,
                        update.duration_ms,
                        update.tool_calls_count,
                        update.sse_events_count,
                        update.error_count,
                        update.last_error,
                        update.trace_id,
                        now_iso(),
                        run,
                    ],
                )?;
                Ok(())
            })
            .await
    }
}
