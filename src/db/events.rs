//! Append-only run event log.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

use crate::db::Db;
use crate::ids::{new_id, now_iso};

#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub event_id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub ts: String,
}

#[derive(Clone)]
pub struct EventsRepo {
    db: Db,
}

impl EventsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert(
        &self,
        run_id: &str,
        tenant_id: &str,
        event_type: &str,
        payload_json: &str,
    ) -> Result<EventRow> {
        let row = EventRow {
            event_id: new_id("evt_"),
            run_id: run_id.to_string(),
            tenant_id: tenant_id.to_string(),
            event_type: event_type.to_string(),
            payload_json: payload_json.to_string(),
            ts: now_iso(),
        };
        let r = row.clone();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO run_events (event_id, run_id, tenant_id, event_type, payload_json, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![r.event_id, r.run_id, r.tenant_id, r.event_type, r.payload_json, r.ts],
                )?;
                Ok(())
            })
            .await?;
        Ok(row)
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<EventRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT event_id, run_id, tenant_id, event_type, payload_json, ts
                     FROM run_events WHERE run_id = ?1 ORDER BY ts ASC",
                )?;
                let rows = stmt
                    .query_map(params![run], |r| {
                        Ok(EventRow {
                            event_id: r.get(0)?,
                            run_id: r.get(1)?,
                            tenant_id: r.get(2)?,
                            event_type: r.get(3)?,
                            payload_json: r.get(4)?,
                            ts: r.get(5)?,
                        })
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn last_ts(&self, run_id: &str) -> Result<Option<String>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT MAX(ts) FROM run_events WHERE run_id = ?1",
                    params![run],
                    |r| r.get(0),
                )
            })
            .await
    }

    pub async fn count_for_run(&self, run_id: &str) -> Result<i64> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM run_events WHERE run_id = ?1",
                    params![run],
                    |r| r.get(0),
                )
            })
            .await
    }
}
