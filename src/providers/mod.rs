//! Broker provider abstraction.
//!
//! Every provider produces the same post-order schema: an `orders` row with
//! fill columns populated on success, plus `order_events`. The execution
//! node selects the variant from the run's execution mode.

pub mod coinbase;
pub mod paper;
pub mod replay;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BrokerCapabilities {
    pub max_orders_per_submit: u32,
    pub supports_batch_submit: bool,
    pub sell_uses_base_size: bool,
    pub buy_uses_quote_size: bool,
}

impl Default for BrokerCapabilities {
    fn default() -> Self {
        // Mirrors the Coinbase single-order constraint.
        Self {
            max_orders_per_submit: 1,
            supports_batch_submit: false,
            sell_uses_base_size: true,
            buy_uses_quote_size: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioView {
    pub positions: serde_json::Value,
    pub total_value: f64,
}

#[async_trait]
pub trait BrokerProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> BrokerCapabilities {
        BrokerCapabilities::default()
    }

    /// Place an order. Returns the new `ord_` id.
    async fn place_order(
        &self,
        run_id: &str,
        tenant_id: &str,
        symbol: &str,
        side: &str,
        notional_usd: f64,
        qty: Option<f64>,
    ) -> Result<String>;

    async fn get_positions(&self, tenant_id: &str) -> Result<PortfolioView>;

    async fn get_balances(&self, tenant_id: &str) -> Result<serde_json::Value>;

    /// Order fills; only exchange-backed providers implement this.
    async fn get_fills(&self, _order_id: &str) -> Result<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }
}
