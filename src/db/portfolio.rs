//! Portfolio snapshots. The latest tenant snapshot is the paper ledger's
//! working state; a fresh tenant starts with $100 USD and no positions.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::Db;
use crate::ids::{new_id, now_iso};

pub const STARTING_CASH_USD: f64 = 100.0;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRow {
    pub snapshot_id: String,
    pub run_id: Option<String>,
    pub tenant_id: String,
    pub balances_json: String,
    pub positions_json: String,
    pub total_value_usd: f64,
    pub ts: String,
}

#[derive(Debug, Clone)]
pub struct PortfolioState {
    pub balances: BTreeMap<String, f64>,
    pub positions: BTreeMap<String, f64>,
    pub total_value_usd: f64,
}

impl Default for PortfolioState {
    fn default() -> Self {
        let mut balances = BTreeMap::new();
        balances.insert("USD".to_string(), STARTING_CASH_USD);
        Self {
            balances,
            positions: BTreeMap::new(),
            total_value_usd: STARTING_CASH_USD,
        }
    }
}

#[derive(Clone)]
pub struct PortfolioRepo {
    db: Db,
}

impl PortfolioRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn latest_state(&self, tenant_id: &str) -> Result<PortfolioState> {
        let tenant = tenant_id.to_string();
        let row: Option<(String, String, f64)> = self
            .db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT balances_json, positions_json, total_value_usd
                     FROM portfolio_snapshots WHERE tenant_id = ?1
                     ORDER BY ts DESC LIMIT 1",
                    params![tenant],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
            })
            .await?;
        match row {
            Some((balances, positions, total)) => Ok(PortfolioState {
                balances: serde_json::from_str(&balances).unwrap_or_default(),
                positions: serde_json::from_str(&positions).unwrap_or_default(),
                total_value_usd: total,
            }),
            None => Ok(PortfolioState::default()),
        }
    }

    pub async fn insert_snapshot(
        &self,
        run_id: Option<&str>,
        tenant_id: &str,
        state: &PortfolioState,
    ) -> Result<String> {
        let snapshot_id = new_id("snap_");
        let id = snapshot_id.clone();
        let run = run_id.map(|s| s.to_string());
        let tenant = tenant_id.to_string();
        let balances = serde_json::to_string(&state.balances)?;
        let positions = serde_json::to_string(&state.positions)?;
        let total = state.total_value_usd;
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO portfolio_snapshots
                        (snapshot_id, run_id, tenant_id, balances_json, positions_json, total_value_usd, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, run, tenant, balances, positions, total, now_iso()],
                )?;
                Ok(())
            })
            .await?;
        Ok(snapshot_id)
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<SnapshotRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT snapshot_id, run_id, tenant_id, balances_json, positions_json, total_value_usd, ts
                     FROM portfolio_snapshots WHERE run_id = ?1 ORDER BY ts ASC",
                )?;
                let rows = stmt
                    .query_map(params![run], |r| {
                        Ok(SnapshotRow {
                            snapshot_id: r.get(0)?,
                            run_id: r.get(1)?,
                            tenant_id: r.get(2)?,
                            balances_json: r.get(3)?,
                            positions_json: r.get(4)?,
                            total_value_usd: r.get(5)?,
                            ts: r.get(6)?,
                        })
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_state_for_fresh_tenant() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let repo = PortfolioRepo::new(db);
        let state = repo.latest_state("t_new").await.unwrap();
        assert_eq!(state.balances.get("USD"), Some(&STARTING_CASH_USD));
        assert!(state.positions.is_empty());
    }

    #[tokio::test]
    async fn test_latest_state_reads_newest_snapshot() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let repo = PortfolioRepo::new(db);
        let mut state = PortfolioState::default();
        state.balances.insert("USD".to_string(), 90.0);
        state.positions.insert("BTC-USD".to_string(), 0.0001);
        state.total_value_usd = 100.0;
        repo.insert_snapshot(None, "t_default", &state).await.unwrap();
        let loaded = repo.latest_state("t_default").await.unwrap();
        assert_eq!(loaded.balances.get("USD"), Some(&90.0));
        assert_eq!(loaded.positions.get("BTC-USD"), Some(&0.0001));
    }
}
