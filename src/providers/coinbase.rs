//! Live Coinbase Advanced Trade provider.
//!
//! Signs every request with the tenant's API key pair, polls order status
//! with exponential backoff until a terminal status or the poll budget runs
//! out, and fetches fills on FILLED. Fails closed on missing credentials,
//! auth failures, and rate limits. Every external call is recorded as a
//! `tool_calls` row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Settings;
use crate::db::evidence::EvidenceRepo;
use crate::db::orders::{NewOrder, OrdersRepo};
use crate::db::Db;
use crate::ids::{new_id, now_iso};
use crate::models::is_terminal_order_status;
use crate::providers::{BrokerProvider, PortfolioView};

const MAX_STATUS_POLLS: u32 = 8;
const POLL_BASE_DELAY_MS: u64 = 500;
const POLL_MAX_DELAY_MS: u64 = 8_000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub struct CoinbaseProvider {
    orders: OrdersRepo,
    evidence: EvidenceRepo,
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    api_secret: String,
}

impl CoinbaseProvider {
    pub fn new(db: Db, settings: &Settings) -> Result<Self> {
        if settings.coinbase_api_key.is_empty() || settings.coinbase_api_secret.is_empty() {
            anyhow::bail!("live trading requires COINBASE_API_KEY and COINBASE_API_SECRET");
        }
        Ok(Self {
            orders: OrdersRepo::new(db.clone()),
            evidence: EvidenceRepo::new(db),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .context("build http client")?,
            api_base: settings.coinbase_api_base.trim_end_matches('/').to_string(),
            api_key: settings.coinbase_api_key.clone(),
            api_secret: settings.coinbase_api_secret.clone(),
        })
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let prehash = format!("{timestamp}{method}{path}{body}");
        let key = base64::engine::general_purpose::STANDARD
            .decode(&self.api_secret)
            .unwrap_or_else(|_| self.api_secret.as_bytes().to_vec());
        let mut mac = HmacSha256::new_from_slice(&key).context("invalid api secret")?;
        mac.update(prehash.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Signed request with a `tool_calls` audit row around it. Calls made
    /// outside a run (account reads) skip the audit row since `tool_calls`
    /// is keyed by run.
    async fn signed_request(
        &self,
        run_id: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let body_text = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        if run_id.is_empty() {
            return self.signed_request_inner(method, path, &body_text).await;
        }
        let tool_call_id = self
            .evidence
            .tool_call_start(
                run_id,
                None,
                "coinbase_api",
                &serde_json::json!({"method": method.as_str(), "path": path}).to_string(),
            )
            .await?;

        let result = self.signed_request_inner(method, path, &body_text).await;
        match &result {
            Ok(json) => {
                self.evidence
                    .tool_call_finish(&tool_call_id, Some(&json.to_string()), None)
                    .await?;
            }
            Err(e) => {
                self.evidence
                    .tool_call_finish(&tool_call_id, None, Some(&e.to_string()))
                    .await?;
            }
        }
        result
    }

    async fn signed_request_inner(
        &self,
        method: reqwest::Method,
        path: &str,
        body_text: &str,
    ) -> Result<serde_json::Value> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self.sign(&timestamp, method.as_str(), path, body_text)?;
        let url = format!("{}{}", self.api_base, path);

        let mut req = self
            .client
            .request(method, &url)
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("Content-Type", "application/json");
        if !body_text.is_empty() {
            req = req.body(body_text.to_string());
        }

        let resp = req.send().await.context("coinbase request")?;
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            anyhow::bail!("coinbase auth failed ({status}); refusing to continue");
        }
        if status.as_u16() == 429 {
            anyhow::bail!("coinbase rate limit (429) on {url}");
        }
        if !status.is_success() {
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > 300 {
                let mut end = 300;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text.truncate(end);
            }
            anyhow::bail!("coinbase request failed: {status} {text}");
        }
        resp.json::<serde_json::Value>().await.context("decode coinbase response")
    }

    async fn poll_until_terminal(&self, run_id: &str, exchange_order_id: &str) -> Result<String> {
        let mut delay = POLL_BASE_DELAY_MS;
        for attempt in 0..MAX_STATUS_POLLS {
            let status_body = self
                .signed_request(
                    run_id,
                    reqwest::Method::GET,
                    &format!("/api/v3/brokerage/orders/historical/{exchange_order_id}"),
                    None,
                )
                .await?;
            let status = status_body
                .pointer("/order/status")
                .and_then(|s| s.as_str())
                .unwrap_or("UNKNOWN")
                .to_uppercase();
            if is_terminal_order_status(&status) {
                return Ok(status);
            }
            warn!(
                exchange_order_id,
                attempt,
                status = %status,
                "order not terminal yet, backing off"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay = (delay * 2).min(POLL_MAX_DELAY_MS);
        }
        Ok("TIMEOUT".to_string())
    }

    async fn fetch_and_store_fills(&self, run_id: &str, order_id: &str) -> Result<(f64, f64, f64)> {
        let fills_body = self
            .signed_request(
                run_id,
                reqwest::Method::GET,
                &format!("/api/v3/brokerage/orders/historical/fills?order_id={order_id}"),
                None,
            )
            .await?;
        let fills = fills_body
            .pointer("/fills")
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default();
        let mut total_qty = 0.0;
        let mut total_notional = 0.0;
        let mut total_fees = 0.0;
        for fill in &fills {
            let price: f64 = fill
                .get("price")
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            let size: f64 = fill
                .get("size")
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            let fee: f64 = fill
                .get("commission")
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            let filled_at = fill
                .get("trade_time")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(now_iso);
            self.orders
                .insert_fill(order_id, price, size, fee, &filled_at)
                .await?;
            total_qty += size;
            total_notional += price * size;
            total_fees += fee;
        }
        let avg_price = if total_qty > 0.0 { total_notional / total_qty } else { 0.0 };
        Ok((total_qty, avg_price, total_fees))
    }
}

#[async_trait]
impl BrokerProvider for CoinbaseProvider {
    fn name(&self) -> &'static str {
        "COINBASE"
    }

    async fn place_order(
        &self,
        run_id: &str,
        tenant_id: &str,
        symbol: &str,
        side: &str,
        notional_usd: f64,
        qty: Option<f64>,
    ) -> Result<String> {
        let side = side.to_uppercase();
        let order_id = new_id("ord_");

        // BUY sizes by quote (USD), SELL by base, per venue capabilities.
        let order_configuration = if side == "BUY" {
            serde_json::json!({
                "market_market_ioc": {"quote_size": format!("{notional_usd:.2}")}
            })
        } else {
            let base_size = qty
                .ok_or_else(|| anyhow::anyhow!("SELL orders require a base qty"))?;
            serde_json::json!({
                "market_market_ioc": {"base_size": format!("{base_size:.8}")}
            })
        };
        let body = serde_json::json!({
            "client_order_id": order_id,
            "product_id": symbol,
            "side": side,
            "order_configuration": order_configuration,
        });

        self.orders
            .insert(NewOrder {
                order_id: &order_id,
                run_id,
                tenant_id,
                provider: "COINBASE",
                symbol,
                side: &side,
                order_type: "MARKET",
                notional_usd,
                qty,
                status: "SUBMITTED",
                filled_qty: None,
                avg_fill_price: None,
                total_fees: None,
                status_updated_at: None,
                created_at: None,
            })
            .await?;
        self.orders
            .insert_event(
                &order_id,
                "SUBMITTED",
                &serde_json::json!({"order_id": order_id}).to_string(),
                None,
            )
            .await?;

        let response = self
            .signed_request(
                run_id,
                reqwest::Method::POST,
                "/api/v3/brokerage/orders",
                Some(body),
            )
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.orders
                    .update_status(&order_id, "FAILED", Some(&e.to_string()), None, None, None)
                    .await?;
                return Err(e);
            }
        };

        let exchange_order_id = response
            .pointer("/success_response/order_id")
            .or_else(|| response.pointer("/order_id"))
            .and_then(|v| v.as_str())
            .unwrap_or(&order_id)
            .to_string();

        let final_status = self.poll_until_terminal(run_id, &exchange_order_id).await?;
        if final_status == "FILLED" {
            let (filled_qty, avg_price, fees) =
                self.fetch_and_store_fills(run_id, &order_id).await?;
            self.orders
                .update_status(
                    &order_id,
                    "FILLED",
                    None,
                    Some(filled_qty),
                    Some(avg_price),
                    Some(fees),
                )
                .await?;
            self.orders
                .insert_event(
                    &order_id,
                    "FILLED",
                    &serde_json::json!({
                        "order_id": order_id,
                        "price": avg_price,
                        "qty": filled_qty,
                    })
                    .to_string(),
                    None,
                )
                .await?;
        } else {
            self.orders
                .update_status(
                    &order_id,
                    &final_status,
                    Some("exchange status after poll budget"),
                    None,
                    None,
                    None,
                )
                .await?;
        }

        info!(
            run_id,
            order_id = %order_id,
            status = %final_status,
            "live order settled"
        );
        Ok(order_id)
    }

    async fn get_positions(&self, tenant_id: &str) -> Result<PortfolioView> {
        let body = self
            .signed_request("", reqwest::Method::GET, "/api/v3/brokerage/accounts", None)
            .await?;
        let mut positions = serde_json::Map::new();
        let mut total_value = 0.0;
        if let Some(accounts) = body.pointer("/accounts").and_then(|a| a.as_array()) {
            for account in accounts {
                let currency = account
                    .get("currency")
                    .and_then(|c| c.as_str())
                    .unwrap_or("");
                let available: f64 = account
                    .pointer("/available_balance/value")
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
                if available > 0.0 && currency != "USD" {
                    positions.insert(format!("{currency}-USD"), serde_json::json!(available));
                }
                if currency == "USD" {
                    total_value += available;
                }
            }
        }
        let _ = tenant_id;
        Ok(PortfolioView {
            positions: serde_json::Value::Object(positions),
            total_value,
        })
    }

    async fn get_balances(&self, _tenant_id: &str) -> Result<serde_json::Value> {
        let body = self
            .signed_request("", reqwest::Method::GET, "/api/v3/brokerage/accounts", None)
            .await?;
        let mut balances = serde_json::Map::new();
        if let Some(accounts) = body.pointer("/accounts").and_then(|a| a.as_array()) {
            for account in accounts {
                let currency = account
                    .get("currency")
                    .and_then(|c| c.as_str())
                    .unwrap_or("");
                let available: f64 = account
                    .pointer("/available_balance/value")
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
                if !currency.is_empty() {
                    balances.insert(currency.to_string(), serde_json::json!(available));
                }
            }
        }
        Ok(serde_json::json!({"balances": balances}))
    }

    async fn get_fills(&self, order_id: &str) -> Result<Vec<serde_json::Value>> {
        let body = self
            .signed_request(
                "",
                reqwest::Method::GET,
                &format!("/api/v3/brokerage/orders/historical/fills?order_id={order_id}"),
                None,
            )
            .await?;
        Ok(body
            .pointer("/fills")
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_credentials_fail_closed() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let mut settings = Settings::from_env();
        settings.coinbase_api_key = String::new();
        settings.coinbase_api_secret = String::new();
        let err = CoinbaseProvider::new(db, &settings).unwrap_err();
        assert!(err.to_string().contains("COINBASE_API_KEY"));
    }

    #[tokio::test]
    async fn test_signature_is_deterministic() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let mut settings = Settings::from_env();
        settings.coinbase_api_key = "key".to_string();
        settings.coinbase_api_secret = "c2VjcmV0".to_string(); // "secret"
        let provider = CoinbaseProvider::new(db, &settings).unwrap();
        let a = provider.sign("1700000000", "GET", "/api/v3/brokerage/accounts", "").unwrap();
        let b = provider.sign("1700000000", "GET", "/api/v3/brokerage/accounts", "").unwrap();
        assert_eq!(a, b);
        let c = provider.sign("1700000001", "GET", "/api/v3/brokerage/accounts", "").unwrap();
        assert_ne!(a, c);
    }
}
