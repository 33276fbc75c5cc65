//! Run evidence: market candle batches (the sole replay source of truth),
//! rankings, tool-call audit rows, and news evidence links.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

use crate::db::Db;
use crate::ids::{new_id, now_iso};

#[derive(Debug, Clone, Serialize)]
pub struct CandlesBatchRow {
    pub batch_id: String,
    pub run_id: String,
    pub symbol: String,
    pub window: String,
    pub candles_json: String,
    pub query_params_json: Option<String>,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewsItemRow {
    pub id: String,
    pub source_id: Option<String>,
    pub published_at: String,
    pub title: String,
    pub url: Option<String>,
    pub asset_symbol: String,
    pub confidence: f64,
}

#[derive(Clone, Debug)]
pub struct EvidenceRepo {
    db: Db,
}

impl EvidenceRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert_candles_batch(
        &self,
        run_id: &str,
        symbol: &str,
        window: &str,
        candles_json: &str,
        query_params_json: Option<&str>,
    ) -> Result<String> {
        let batch_id = new_id("batch_");
        let id = batch_id.clone();
        let run = run_id.to_string();
        let symbol = symbol.to_string();
        let window = window.to_string();
        let candles = candles_json.to_string();
        let query = query_params_json.map(|s| s.to_string());
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO market_candles_batches
                        (batch_id, run_id, symbol, window, candles_json, query_params_json, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, run, symbol, window, candles, query, now_iso()],
                )?;
                Ok(())
            })
            .await?;
        Ok(batch_id)
    }

    pub async fn list_candles_batches(&self, run_id: &str) -> Result<Vec<CandlesBatchRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT batch_id, run_id, symbol, window, candles_json, query_params_json, ts
                     FROM market_candles_batches WHERE run_id = ?1 ORDER BY ts ASC",
                )?;
                let rows = stmt
                    .query_map(params![run], |r| {
                        Ok(CandlesBatchRow {
                            batch_id: r.get(0)?,
                            run_id: r.get(1)?,
                            symbol: r.get(2)?,
                            window: r.get(3)?,
                            candles_json: r.get(4)?,
                            query_params_json: r.get(5)?,
                            ts: r.get(6)?,
                        })
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    pub async fn insert_ranking(
        &self,
        run_id: &str,
        node_id: &str,
        window: &str,
        metric: &str,
        selected_symbol: &str,
        selected_score: f64,
        table_json: &str,
    ) -> Result<String> {
        let ranking_id = new_id("rank_");
        let id = ranking_id.clone();
        let run = run_id.to_string();
        let node = node_id.to_string();
        let window = window.to_string();
        let metric = metric.to_string();
        let symbol = selected_symbol.to_string();
        let table = table_json.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO rankings
                        (ranking_id, run_id, node_id, window, metric, selected_symbol, selected_score, table_json, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![id, run, node, window, metric, symbol, selected_score, table, now_iso()],
                )?;
                Ok(())
            })
            .await?;
        Ok(ranking_id)
    }

    /// Open a tool-call audit row in RUNNING status. Returns its id.
    pub async fn tool_call_start(
        &self,
        run_id: &str,
        node_id: Option<&str>,
        tool_name: &str,
        request_json: &str,
    ) -> Result<String> {
        let id = new_id("tool_");
        let tool_id = id.clone();
        let run = run_id.to_string();
        let node = node_id.map(|s| s.to_string());
        let name = tool_name.to_string();
        let request = request_json.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO tool_calls (id, run_id, node_id, tool_name, request_json, status, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'RUNNING', ?6)",
                    params![tool_id, run, node, name, request, now_iso()],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn tool_call_finish(
        &self,
        tool_call_id: &str,
        response_json: Option<&str>,
        error_text: Option<&str>,
    ) -> Result<()> {
        let id = tool_call_id.to_string();
        let response = response_json.map(|s| s.to_string());
        let error = error_text.map(|s| s.to_string());
        let status = if error.is_some() { "FAILED" } else { "SUCCEEDED" };
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "UPDATE tool_calls SET response_json = ?1, error_text = ?2, status = ?3 WHERE id = ?4",
                    params![response, error, status, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn tool_call_counts(&self, run_id: &str) -> Result<(i64, i64)> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tool_calls WHERE run_id = ?1",
                    params![run.clone()],
                    |r| r.get(0),
                )?;
                let failed: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tool_calls WHERE run_id = ?1 AND status = 'FAILED'",
                    params![run.clone()],
                    |r| r.get(0),
                )?;
                Ok((total, failed))
            })
            .await
    }

    pub async fn list_tool_calls(&self, run_id: &str) -> Result<Vec<serde_json::Value>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, node_id, tool_name, request_json, response_json, status, error_text, ts
                     FROM tool_calls WHERE run_id = ?1 ORDER BY ts ASC",
                )?;
                let rows = stmt
                    .query_map(params![run], |r| {
                        Ok(serde_json::json!({
                            "id": r.get::<_, String>(0)?,
                            "node_id": r.get::<_, Option<String>>(1)?,
                            "tool_name": r.get::<_, String>(2)?,
                            "request_json": r.get::<_, Option<String>>(3)?,
                            "response_json": r.get::<_, Option<String>>(4)?,
                            "status": r.get::<_, String>(5)?,
                            "error_text": r.get::<_, Option<String>>(6)?,
                            "ts": r.get::<_, String>(7)?,
                        }))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    /// Link a news item to a run as replay evidence (idempotent).
    pub async fn link_news_evidence(&self, run_id: &str, item_id: &str) -> Result<()> {
        let run = run_id.to_string();
        let item = item_id.to_string();
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO run_news_evidence (run_id, item_id, role) VALUES (?1, ?2, 'context')",
                    params![run, item],
                )?;
                Ok(())
            })
            .await
    }

    /// News items mentioning `asset` published inside `(since, until]`.
    pub async fn news_items_for_asset(
        &self,
        asset: &str,
        since: &str,
        until: &str,
        limit: i64,
    ) -> Result<Vec<NewsItemRow>> {
        let asset = asset.to_string();
        let since = since.to_string();
        let until = until.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT i.id, i.source_id, i.published_at, i.title, i.url, m.asset_symbol, m.confidence
                     FROM news_items i
                     JOIN news_asset_mentions m ON i.id = m.item_id
                     WHERE m.asset_symbol = ?1 AND i.published_at <= ?2 AND i.published_at > ?3
                     ORDER BY i.published_at DESC LIMIT ?4",
                )?;
                let rows = stmt
                    .query_map(params![asset, until, since, limit], news_item_from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    /// News items linked as evidence to `source_run_id` (REPLAY path).
    pub async fn news_items_for_source_run(&self, source_run_id: &str) -> Result<Vec<NewsItemRow>> {
        let source = source_run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT i.id, i.source_id, i.published_at, i.title, i.url,
                            COALESCE(m.asset_symbol, ''), COALESCE(m.confidence, 1.0)
                     FROM run_news_evidence e
                     JOIN news_items i ON e.item_id = i.id
                     LEFT JOIN news_asset_mentions m ON i.id = m.item_id
                     WHERE e.run_id = ?1
                     ORDER BY i.published_at DESC",
                )?;
                let rows = stmt
                    .query_map(params![source], news_item_from_row)?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    /// Seed helper for tests and ingestion pipelines.
    pub async fn insert_news_item(
        &self,
        title: &str,
        asset_symbol: &str,
        published_at: &str,
        url: Option<&str>,
    ) -> Result<String> {
        let item_id = new_id("news_");
        let id = item_id.clone();
        let title = title.to_string();
        let asset = asset_symbol.to_string();
        let published = published_at.to_string();
        let url = url.map(|s| s.to_string());
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO news_items (id, source_id, published_at, title, url, content_hash)
                     VALUES (?1, NULL, ?2, ?3, ?4, NULL)",
                    params![id, published, title, url],
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO news_asset_mentions (item_id, asset_symbol, confidence)
                     VALUES (?1, ?2, 1.0)",
                    params![id, asset],
                )?;
                Ok(())
            })
            .await?;
        Ok(item_id)
    }
}

fn news_item_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<NewsItemRow> {
    Ok(NewsItemRow {
        id: r.get(0)?,
        source_id: r.get(1)?,
        published_at: r.get(2)?,
        title: r.get(3)?,
        url: r.get(4)?,
        asset_symbol: r.get(5)?,
        confidence: r.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::runs::RunsRepo;

    #[tokio::test]
    async fn test_candles_batches_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let runs = RunsRepo::new(db.clone());
        let run_id = runs.create("t_default", "PAPER", None, None).await.unwrap();
        let repo = EvidenceRepo::new(db);
        repo.insert_candles_batch(&run_id, "BTC-USD", "24h", "[[1,2,3]]", Some("{}"))
            .await
            .unwrap();
        let batches = repo.list_candles_batches(&run_id).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].symbol, "BTC-USD");
    }

    #[tokio::test]
    async fn test_news_window_query() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let repo = EvidenceRepo::new(db);
        repo.insert_news_item("BTC rallies", "BTC", "2026-01-02T00:00:00Z", None)
            .await
            .unwrap();
        repo.insert_news_item("Old BTC news", "BTC", "2025-01-01T00:00:00Z", None)
            .await
            .unwrap();
        let items = repo
            .news_items_for_asset("BTC", "2026-01-01T00:00:00Z", "2026-01-03T00:00:00Z", 10)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "BTC rallies");
    }
}
