//! Eval result rows written by the heuristic evaluators.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

use crate::db::Db;
use crate::ids::{new_id, now_iso};

#[derive(Debug, Clone, Serialize)]
pub struct EvalRow {
    pub eval_id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub conversation_id: Option<String>,
    pub eval_name: String,
    pub score: f64,
    pub reasons_json: String,
    pub step_name: Option<String>,
    pub eval_category: String,
    pub evaluator_type: String,
    pub ts: String,
}

pub struct NewEval<'a> {
    pub run_id: &'a str,
    pub tenant_id: &'a str,
    pub conversation_id: Option<&'a str>,
    pub eval_name: &'a str,
    pub score: f64,
    pub reasons: serde_json::Value,
    pub step_name: Option<&'a str>,
    pub eval_category: &'a str,
    pub thresholds: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct EvalsRepo {
    db: Db,
}

impl EvalsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert(&self, eval: NewEval<'_>) -> Result<String> {
        let eval_id = new_id("eval_");
        let id = eval_id.clone();
        let run = eval.run_id.to_string();
        let tenant = eval.tenant_id.to_string();
        let conv = eval.conversation_id.map(|s| s.to_string());
        let name = eval.eval_name.to_string();
        let score = eval.score.clamp(0.0, 1.0);
        let reasons = eval.reasons.to_string();
        let step = eval.step_name.map(|s| s.to_string());
        let category = eval.eval_category.to_string();
        let thresholds = eval.thresholds.map(|t| t.to_string());
        self.db
            .with_txn(move |conn| {
                conn.execute(
                    "INSERT INTO eval_results
                        (eval_id, run_id, tenant_id, conversation_id, eval_name, score,
                         reasons_json, step_name, eval_category, evaluator_type, thresholds_json, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'heuristic', ?10, ?11)",
                    params![id, run, tenant, conv, name, score, reasons, step, category, thresholds, now_iso()],
                )?;
                Ok(())
            })
            .await?;
        Ok(eval_id)
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<EvalRow>> {
        let run = run_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT eval_id, run_id, tenant_id, conversation_id, eval_name, score,
                            reasons_json, step_name, eval_category, evaluator_type, ts
                     FROM eval_results WHERE run_id = ?1 ORDER BY ts ASC",
                )?;
                let rows = stmt
                    .query_map(params![run], |r| {
                        Ok(EvalRow {
                            eval_id: r.get(0)?,
                            run_id: r.get(1)?,
                            tenant_id: r.get(2)?,
                            conversation_id: r.get(3)?,
                            eval_name: r.get(4)?,
                            score: r.get(5)?,
                            reasons_json: r.get(6)?,
                            step_name: r.get(7)?,
                            eval_category: r.get(8)?,
                            evaluator_type: r.get(9)?,
                            ts: r.get(10)?,
                        })
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }

    /// Per-eval-name average scores across a tenant's recent runs.
    pub async fn summary(&self, tenant_id: &str) -> Result<Vec<serde_json::Value>> {
        let tenant = tenant_id.to_string();
        self.db
            .with_conn_retry(3, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT eval_name, eval_category, COUNT(*), AVG(score), MIN(score)
                     FROM eval_results WHERE tenant_id = ?1
                     GROUP BY eval_name, eval_category ORDER BY eval_name ASC",
                )?;
                let rows = stmt
                    .query_map(params![tenant], |r| {
                        Ok(serde_json::json!({
                            "eval_name": r.get::<_, String>(0)?,
                            "eval_category": r.get::<_, String>(1)?,
                            "count": r.get::<_, i64>(2)?,
                            "avg_score": r.get::<_, f64>(3)?,
                            "min_score": r.get::<_, f64>(4)?,
                        }))
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .await
    }
}
