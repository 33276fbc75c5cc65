//! Market data access: product catalog, candles, and spot prices.
//!
//! The `MarketData` trait is the seam the orchestrator depends on. The
//! production implementation talks to the Coinbase public REST API behind a
//! circuit breaker; tests inject `StubMarketData`, which also counts calls
//! so replay determinism can assert zero external access.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

pub const STABLECOINS: &[&str] = &["USDC", "USDT", "DAI", "BUSD", "TUSD", "USDP", "GUSD"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub base_currency: String,
    pub quote_currency: String,
}

/// One OHLCV candle: `[ts, low, high, open, close, volume]` on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub low: f64,
    pub high: f64,
    pub open: f64,
    pub close: f64,
    pub volume: f64,
}

#[async_trait]
pub trait MarketData: Send + Sync {
    /// USD-quoted tradable products.
    async fn list_products(&self) -> Result<Vec<Product>>;

    /// Candles for `product_id` covering the trailing `lookback_hours`.
    async fn get_candles(&self, product_id: &str, lookback_hours: i64) -> Result<Vec<Candle>>;

    /// Current spot price.
    async fn get_price(&self, product_id: &str) -> Result<f64>;
}

/// Trip after `threshold` consecutive failures; stay open for `cooldown`.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
            threshold,
            cooldown,
        }
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                state.open_until = None;
                state.consecutive_failures = 0;
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        self.state.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                failures = state.consecutive_failures,
                cooldown_s = self.cooldown.as_secs(),
                "market data circuit breaker opened"
            );
        }
    }
}

/// Coinbase Exchange public market data (no auth needed for candles).
pub struct CoinbaseMarketData {
    client: reqwest::Client,
    base_url: String,
    breaker: CircuitBreaker,
}

impl CoinbaseMarketData {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            breaker: CircuitBreaker::new(3, Duration::from_secs(300)),
        }
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        if !self.breaker.allow() {
            anyhow::bail!("market data circuit breaker open, skipping call to {path}");
        }
        let url = format!("{}{}", self.base_url, path);
        let result = async {
            let resp = self.client.get(&url).send().await.context("market data request")?;
            if resp.status().as_u16() == 429 {
                anyhow::bail!("market data rate limit (429) for {url}");
            }
            if !resp.status().is_success() {
                anyhow::bail!("market data request failed: {} {}", resp.status(), url);
            }
            resp.json::<serde_json::Value>().await.context("decode market data response")
        }
        .await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }
}

#[async_trait]
impl MarketData for CoinbaseMarketData {
    async fn list_products(&self) -> Result<Vec<Product>> {
        let body = self.get_json("/products").await?;
        let products = body
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|p| {
                        Some(Product {
                            product_id: p.get("id")?.as_str()?.to_string(),
                            base_currency: p.get("base_currency")?.as_str()?.to_string(),
                            quote_currency: p.get("quote_currency")?.as_str()?.to_string(),
                        })
                    })
                    .filter(|p| p.quote_currency == "USD")
                    .collect()
            })
            .unwrap_or_default();
        Ok(products)
    }

    async fn get_candles(&self, product_id: &str, lookback_hours: i64) -> Result<Vec<Candle>> {
        // Hourly granularity up to 7d; daily beyond.
        let granularity = if lookback_hours <= 168 { 3600 } else { 86400 };
        let body = self
            .get_json(&format!(
                "/products/{product_id}/candles?granularity={granularity}"
            ))
            .await?;
        let mut candles: Vec<Candle> = body
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let row = row.as_array()?;
                        Some(Candle {
                            ts: row.first()?.as_i64()?,
                            low: row.get(1)?.as_f64()?,
                            high: row.get(2)?.as_f64()?,
                            open: row.get(3)?.as_f64()?,
                            close: row.get(4)?.as_f64()?,
                            volume: row.get(5)?.as_f64()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        candles.sort_by_key(|c| c.ts);
        let cutoff = chrono::Utc::now().timestamp() - lookback_hours * 3600;
        candles.retain(|c| c.ts >= cutoff);
        if candles.is_empty() {
            anyhow::bail!("product details unavailable: no candles for {product_id}");
        }
        Ok(candles)
    }

    async fn get_price(&self, product_id: &str) -> Result<f64> {
        let body = self.get_json(&format!("/products/{product_id}/ticker")).await?;
        body.get("price")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| anyhow::anyhow!("product details unavailable: no ticker price for {product_id}"))
    }
}

/// Deterministic in-memory market data with call counters. Used by tests
/// and by the replay-determinism property check.
#[derive(Default)]
pub struct StubMarketData {
    prices: Mutex<HashMap<String, f64>>,
    candles: Mutex<HashMap<String, Vec<Candle>>>,
    pub candle_calls: AtomicU64,
    pub price_calls: AtomicU64,
    pub product_calls: AtomicU64,
}

impl StubMarketData {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_price(&self, product_id: &str, price: f64) {
        self.prices.lock().insert(product_id.to_string(), price);
    }

    /// Seed a simple two-candle series producing the given return.
    pub fn set_series(&self, product_id: &str, first_close: f64, last_close: f64) {
        let now = chrono::Utc::now().timestamp();
        self.candles.lock().insert(
            product_id.to_string(),
            vec![
                Candle {
                    ts: now - 7200,
                    low: first_close,
                    high: first_close,
                    open: first_close,
                    close: first_close,
                    volume: 10.0,
                },
                Candle {
                    ts: now - 3600,
                    low: last_close,
                    high: last_close,
                    open: last_close,
                    close: last_close,
                    volume: 10.0,
                },
            ],
        );
        self.set_price(product_id, last_close);
    }

    pub fn total_calls(&self) -> u64 {
        self.candle_calls.load(Ordering::SeqCst)
            + self.price_calls.load(Ordering::SeqCst)
            + self.product_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketData for StubMarketData {
    async fn list_products(&self) -> Result<Vec<Product>> {
        self.product_calls.fetch_add(1, Ordering::SeqCst);
        let products = self
            .candles
            .lock()
            .keys()
            .map(|product_id| Product {
                product_id: product_id.clone(),
                base_currency: product_id.split('-').next().unwrap_or("").to_string(),
                quote_currency: "USD".to_string(),
            })
            .collect();
        Ok(products)
    }

    async fn get_candles(&self, product_id: &str, _lookback_hours: i64) -> Result<Vec<Candle>> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        self.candles
            .lock()
            .get(product_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("product details unavailable: no candles for {product_id}"))
    }

    async fn get_price(&self, product_id: &str) -> Result<f64> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        self.prices
            .lock()
            .get(product_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("product details unavailable: no price for {product_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(300));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());
    }

    #[test]
    fn test_breaker_closes_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.allow());
        // Success resets the failure count.
        breaker.record_success();
        assert!(breaker.allow());
    }

    #[tokio::test]
    async fn test_stub_counts_calls() {
        let stub = StubMarketData::new();
        stub.set_series("BTC-USD", 100.0, 110.0);
        stub.get_candles("BTC-USD", 24).await.unwrap();
        stub.get_price("BTC-USD").await.unwrap();
        assert_eq!(stub.total_calls(), 2);
        assert!(stub.get_candles("XYZ-USD", 24).await.is_err());
    }
}
