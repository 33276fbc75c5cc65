//! Replay provider: copies the matching order (and its events) from the
//! source run with renumbered ids. Never touches the network.

use anyhow::Result;
use async_trait::async_trait;

use crate::db::orders::{NewOrder, OrdersRepo};
use crate::db::Db;
use crate::ids::new_id;
use crate::providers::{BrokerProvider, PortfolioView};

pub struct ReplayProvider {
    orders: OrdersRepo,
    source_run_id: String,
}

impl ReplayProvider {
    pub fn new(db: Db, source_run_id: &str) -> Self {
        Self {
            orders: OrdersRepo::new(db),
            source_run_id: source_run_id.to_string(),
        }
    }
}

#[async_trait]
impl BrokerProvider for ReplayProvider {
    fn name(&self) -> &'static str {
        "REPLAY"
    }

    async fn place_order(
        &self,
        run_id: &str,
        tenant_id: &str,
        symbol: &str,
        side: &str,
        _notional_usd: f64,
        _qty: Option<f64>,
    ) -> Result<String> {
        let side = side.to_uppercase();
        let source_orders = self.orders.list_for_run(&self.source_run_id).await?;
        let source = source_orders
            .iter()
            .find(|o| o.symbol == symbol && o.side == side)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no matching order ({symbol}, {side}) in source run {}",
                    self.source_run_id
                )
            })?;

        let new_order_id = new_id("ord_");
        self.orders
            .insert(NewOrder {
                order_id: &new_order_id,
                run_id,
                tenant_id,
                provider: "REPLAY",
                symbol: &source.symbol,
                side: &source.side,
                order_type: &source.order_type,
                notional_usd: source.notional_usd,
                qty: source.qty,
                status: &source.status,
                filled_qty: source.filled_qty,
                avg_fill_price: source.avg_fill_price,
                total_fees: source.total_fees,
                status_updated_at: source.status_updated_at.as_deref(),
                created_at: None,
            })
            .await?;

        for (event_type, payload_json, ts) in self.orders.list_events(&source.order_id).await? {
            self.orders
                .insert_event(&new_order_id, &event_type, &payload_json, Some(&ts))
                .await?;
        }

        Ok(new_order_id)
    }

    async fn get_positions(&self, _tenant_id: &str) -> Result<PortfolioView> {
        Ok(PortfolioView {
            positions: serde_json::json!({}),
            total_value: 0.0,
        })
    }

    async fn get_balances(&self, _tenant_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({"balances": {"USD": 0.0}}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::runs::RunsRepo;
    use crate::market_data::StubMarketData;
    use crate::providers::paper::PaperProvider;

    #[tokio::test]
    async fn test_replay_copies_source_order_and_events() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let runs = RunsRepo::new(db.clone());
        let source_run = runs.create("t_default", "PAPER", None, None).await.unwrap();

        let stub = StubMarketData::new();
        stub.set_price("BTC-USD", 40_000.0);
        let paper = PaperProvider::new(db.clone(), stub.clone());
        paper
            .place_order(&source_run, "t_default", "BTC-USD", "BUY", 10.0, None)
            .await
            .unwrap();

        let replay_run = runs
            .create("t_default", "REPLAY", Some(&source_run), None)
            .await
            .unwrap();
        let calls_before = stub.total_calls();
        let replay = ReplayProvider::new(db.clone(), &source_run);
        let new_order_id = replay
            .place_order(&replay_run, "t_default", "BTC-USD", "BUY", 999.0, None)
            .await
            .unwrap();
        // Replay never consults market data.
        assert_eq!(stub.total_calls(), calls_before);

        let orders = OrdersRepo::new(db);
        let copied = orders.get("t_default", &new_order_id).await.unwrap().unwrap();
        assert_eq!(copied.provider, "REPLAY");
        assert_eq!(copied.notional_usd, 10.0);
        assert_eq!(copied.status, "FILLED");
        assert_eq!(copied.avg_fill_price, Some(40_000.0));
        let events = orders.list_events(&new_order_id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_replay_missing_source_order_errors() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let runs = RunsRepo::new(db.clone());
        let source_run = runs.create("t_default", "PAPER", None, None).await.unwrap();
        let replay_run = runs
            .create("t_default", "REPLAY", Some(&source_run), None)
            .await
            .unwrap();
        let replay = ReplayProvider::new(db, &source_run);
        let err = replay
            .place_order(&replay_run, "t_default", "ETH-USD", "BUY", 10.0, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no matching order"));
    }
}
