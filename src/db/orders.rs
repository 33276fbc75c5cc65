//! Orders, order events, and fills. Orders survive their run as immutable
//! history; status only moves toward a terminal value.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::warn;

use crate::db::Db;
use crate::ids::{new_id, now_iso};
use crate::models::is_terminal_order_status;

#[derive(Debug, Clone, Serialize)]
pub struct OrderRow {
    pub order_id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub provider: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub notional_usd: f64,
    pub qty: Option<f64>,
    pub status: String,
    pub filled_qty: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub total_fees: Option<f64>,
    pub status_reason: Option<String>,
    pub status_updated_at: Option<String>,
    pub created_at: String,
}

impl OrderRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            order_id: row.get("order_id")?,
            run_id: row.get("run_id")?,
            tenant_id: row.get("tenant_id")?,
            provider: row.get("provider")?,
            symbol: row.get("symbol")?,
            side: row.get("side")?,
            order_type: row.get("order_type")?,
            notional_usd: row.get("notional_usd")?,
            qty: row.get("qty")?,
            status: row.get("status")?,
            filled_qty: row.get("filled_qty")?,
            avg_fill_price: row.get("avg_fill_price")?,
            total_fees: row.get("total_fees")?,
            status_reason: row.get("status_reason")?,
            status_updated_at: row.get("status_updated_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

const SELECT_ORDER: &str = "SELECT order_id, run_id, tenant_id, provider, symbol, side, order_type, \
     notional_usd, qty, status, filled_qty, avg_fill_price, total_fees, \
     status_reason, status_updated_at, created_at FROM orders";

pub struct NewOrder<'a> {
    pub order_id: &'a str,
    pub run_id: &'a str,
    pub tenant_id: &'a str,
    pub provider: &'a str,
    pub symbol: &'a str,
    pub side: &'a str,
    pub order_type: &'a str,
    pub notional_usd: f64,
    pub qty: Option<f64>,
    pub status: &'a str,
    pub filled_qty: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub total_fees: Option<f64>,
    pub status_updated_at: Option<&'a str>,
    pub created_at: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct OrdersRepo {
    db: Db,
}

impl OrdersRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert(&self, order: NewOrder<'_>) -> Result<()> {
        let params_owned = (
            order.order_id.to_string(),
            order.run_id.to_string(),
            order.tenant_id.to_string(),
            order.provider.to_string(),
            order.symbol.to_string(),
            order.side.to_string(),
            order.order_type.to_string(),
            order.notional_usd,
            order.qty,
            order.status.to_string(),
            order.filled_qty,
            order.avg_fill_price,
            order.total_fees,
            order.status_updated_at.map(|s| s.to_string()),
            order.created_at.map(|s| s.to_string()).unwrap_or_else(now_iso),
        );
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO orders (order_id, run_id, tenant_id, provider, symbol, side,
                        order_type, notional_usd, qty, status, filled_qty, avg_fill_price,
                        total_fees, status_updated_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        params_owned.0,
                        params_owned.1,
                        params_owned.2,
                        params_owned.3,
                        params_owned.4,
                        params_owned.5,
                        params_owned.6,
                        params_owned.7,
                        params_owned.8,
                        params_owned.9,
                        params_owned.10,
                        params_owned.11,
                        params_owned.12,
                        params_owned.13,
                        params_owned.14,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, tenant_id: &str, order_id: &str) -> Result<Option<OrderRow>> {
        let tenant = tenant_id.to_string();
        let id = order_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    &format!("{SELECT_ORDER} WHERE order_id = ?1 AND tenant_id = ?2"),
                    params![id, tenant],
                    OrderRow::from_row,
                )
                .optional()
            })
            .await
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<OrderRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "{SELECT_ORDER} WHERE run_id = ?1 ORDER BY created_at ASC"
                ))?;
                let rows = stmt
                    .query_map(params![run], OrderRow::from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn list_for_tenant(&self, tenant_id: &str, limit: i64) -> Result<Vec<OrderRow>> {
        let tenant = tenant_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "{SELECT_ORDER} WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![tenant, limit], OrderRow::from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn last_for_run(&self, run_id: &str) -> Result<Option<OrderRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    &format!("{SELECT_ORDER} WHERE run_id = ?1 ORDER BY created_at DESC LIMIT 1"),
                    params![run],
                    OrderRow::from_row,
                )
                .optional()
            })
            .await
    }

    /// Update order status; refuses to move a terminal order.
    pub async fn update_status(
        &self,
        order_id: &str,
        status: &str,
        reason: Option<&str>,
        filled_qty: Option<f64>,
        avg_fill_price: Option<f64>,
        total_fees: Option<f64>,
    ) -> Result<()> {
        let id = order_id.to_string();
        let status = status.to_uppercase();
        let reason = reason.map(|s| s.to_string());
        self.db
            .with_txn(move |conn| {
                let current: Option<String> = conn
                    .query_row(
                        "SELECT status FROM orders WHERE order_id = ?1",
                        params![id.clone()],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(current) = current {
                    if is_terminal_order_status(&current) && current != status {
                        warn!(order_id = %id, from = %current, to = %status, "refusing to move terminal order");
                        return Ok(());
                    }
                }
                conn.execute(
                    "UPDATE orders SET status = ?1, status_reason = COALESCE(?2, status_reason),
                        filled_qty = COALESCE(?3, filled_qty),
                        avg_fill_price = COALESCE(?4, avg_fill_price),
                        total_fees = COALESCE(?5, total_fees),
                        status_updated_at = ?6
                     WHERE order_id = ?7",
                    params![status, reason, filled_qty, avg_fill_price, total_fees, now_iso(), id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn insert_event(
        &self,
        order_id: &str,
        event_type: &str,
        payload_json: &str,
        ts: Option<&str>,
    ) -> Result<()> {
        let id = new_id("evt_");
        let order = order_id.to_string();
        let event_type = event_type.to_string();
        let payload = payload_json.to_string();
        let ts = ts.map(|s| s.to_string()).unwrap_or_else(now_iso);
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO order_events (id, order_id, event_type, payload_json, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, order, event_type, payload, ts],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_events(&self, order_id: &str) -> Result<Vec<(String, String, String)>> {
        let order = order_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT event_type, payload_json, ts FROM order_events
                     WHERE order_id = ?1 ORDER BY ts ASC",
                )?;
                let rows = stmt
                    .query_map(params![order], |r| {
                        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn insert_fill(
        &self,
        order_id: &str,
        price: f64,
        size: f64,
        fee: f64,
        filled_at: &str,
    ) -> Result<String> {
        let fill_id = new_id("fill_");
        let id = fill_id.clone();
        let order = order_id.to_string();
        let filled_at = filled_at.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO fills (fill_id, order_id, price, size, fee, filled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, order, price, size, fee, filled_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(fill_id)
    }

    pub async fn list_fills_for_run(&self, run_id: &str) -> Result<Vec<serde_json::Value>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT f.fill_id, f.order_id, f.price, f.size, f.fee, f.filled_at
                     FROM fills f JOIN orders o ON o.order_id = f.order_id
                     WHERE o.run_id = ?1 ORDER BY f.filled_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![run], |r| {
                        Ok(serde_json::json!({
                            "fill_id": r.get::<_, String>(0)?,
                            "order_id": r.get::<_, String>(1)?,
                            "price": r.get::<_, f64>(2)?,
                            "size": r.get::<_, f64>(3)?,
                            "fee": r.get::<_, f64>(4)?,
                            "filled_at": r.get::<_, String>(5)?,
                        }))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    /// SUBMITTED orders older than `age_seconds`, for staleness flagging.
    pub async fn stale_submitted(&self, run_id: &str, age_seconds: i64) -> Result<Vec<String>> {
        let run = run_id.to_string();
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(age_seconds))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT order_id FROM orders
                     WHERE run_id = ?1 AND status = 'SUBMITTED' AND created_at < ?2",
                )?;
                let rows = stmt
                    .query_map(params![run, cutoff], |r| r.get::<_, String>(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn count_for_run(&self, run_id: &str) -> Result<i64> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM orders WHERE run_id = ?1",
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

    async fn repo() -> OrdersRepo {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        OrdersRepo::new(db)
    }

    fn sample<'a>(order_id: &'a str) -> NewOrder<'a> {
        NewOrder {
            order_id,
            run_id: "run_1",
            tenant_id: "t_default",
            provider: "PAPER",
            symbol: "BTC-USD",
            side: "BUY",
            order_type: "MARKET",
            notional_usd: 10.0,
            qty: Some(0.0001),
            status: "SUBMITTED",
            filled_qty: None,
            avg_fill_price: None,
            total_fees: None,
            status_updated_at: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_update_fill_columns() {
        let repo = repo().await;
        repo.insert(sample("ord_1")).await.unwrap();
        repo.update_status("ord_1", "FILLED", None, Some(0.0001), Some(100000.0), Some(0.0))
            .await
            .unwrap();
        let row = repo.get("t_default", "ord_1").await.unwrap().unwrap();
        assert_eq!(row.status, "FILLED");
        assert_eq!(row.filled_qty, Some(0.0001));
        assert!(row.status_updated_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_order_not_movable() {
        let repo = repo().await;
        repo.insert(sample("ord_2")).await.unwrap();
        repo.update_status("ord_2", "FILLED", None, Some(1.0), Some(2.0), Some(0.0))
            .await
            .unwrap();
        repo.update_status("ord_2", "CANCELED", Some("late cancel"), None, None, None)
            .await
            .unwrap();
        let row = repo.get("t_default", "ord_2").await.unwrap().unwrap();
        assert_eq!(row.status, "FILLED");
    }

    #[tokio::test]
    async fn test_stale_submitted_detection() {
        let repo = repo().await;
        let old_ts = (chrono::Utc::now() - chrono::Duration::seconds(120))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let mut order = sample("ord_3");
        order.created_at = Some(&old_ts);
        repo.insert(order).await.unwrap();
        let stale = repo.stale_submitted("run_1", 60).await.unwrap();
        assert_eq!(stale, vec!["ord_3".to_string()]);
    }
}
