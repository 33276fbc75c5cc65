//! Replay determinism: a REPLAY run reproduces the source run's orders
//! and briefs from stored evidence with zero external market-data calls.

mod common;

use std::time::Duration;

use common::{harness, seed_confirmation, wait_for_terminal};
use execdesk_backend::api::confirmations::confirm_impl;
use execdesk_backend::orchestrator::runner;

#[tokio::test(flavor = "multi_thread")]
async fn replay_reproduces_source_without_external_calls() {
    let h = harness().await;
    // Seed one headline so the source run produces news evidence.
    h.deps
        .evidence()
        .insert_news_item("BTC rallies on ETF inflows", "BTC", &execdesk_backend::ids::now_iso(), None)
        .await
        .unwrap();

    // Source run: plain paper trade.
    let conf_id = seed_confirmation(&h.deps, "t_default", "PAPER", "BTC", 10.0, None).await;
    let response = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .unwrap();
    let source_run_id = response["run_id"].as_str().unwrap().to_string();
    assert_eq!(
        wait_for_terminal(&h.deps, &source_run_id, Duration::from_secs(10)).await,
        "COMPLETED"
    );
    let source_orders = h.deps.orders().list_for_run(&source_run_id).await.unwrap();
    assert_eq!(source_orders.len(), 1);

    // Replay: copy intent from the source, freeze the market stub counter.
    let source = h.deps.runs().get(&source_run_id).await.unwrap().unwrap();
    let replay_run_id = runner::create_run(&h.deps, "t_default", "REPLAY", Some(&source_run_id), None)
        .await
        .unwrap();
    h.deps
        .runs()
        .set_trade_fields(
            &replay_run_id,
            "replay run",
            source.metadata_json.as_deref().unwrap_or("{}"),
            source.parsed_intent_json.as_deref().unwrap_or("{}"),
            "{}",
            source.news_enabled,
            &source.asset_class,
            source.locked_product_id.as_deref(),
            None,
        )
        .await
        .unwrap();

    let calls_before = h.market.total_calls();
    runner::execute_run(&h.deps, &replay_run_id).await.unwrap();
    assert_eq!(
        h.market.total_calls(),
        calls_before,
        "replay must make zero market data calls"
    );

    let replay = h.deps.runs().get(&replay_run_id).await.unwrap().unwrap();
    assert_eq!(replay.status, "COMPLETED");

    // Orders match the source in (symbol, side, notional) with fresh ids.
    let replay_orders = h.deps.orders().list_for_run(&replay_run_id).await.unwrap();
    assert_eq!(replay_orders.len(), 1);
    let (src, rep) = (&source_orders[0], &replay_orders[0]);
    assert_ne!(src.order_id, rep.order_id);
    assert_eq!(rep.provider, "REPLAY");
    assert_eq!(src.symbol, rep.symbol);
    assert_eq!(src.side, rep.side);
    assert_eq!(src.notional_usd, rep.notional_usd);
    assert_eq!(src.filled_qty, rep.filled_qty);
    assert_eq!(src.avg_fill_price, rep.avg_fill_price);

    // The replay's candle batches mirror the source's evidence.
    let source_batches = h.deps.evidence().list_candles_batches(&source_run_id).await.unwrap();
    let replay_batches = h.deps.evidence().list_candles_batches(&replay_run_id).await.unwrap();
    assert_eq!(source_batches.len(), replay_batches.len());
    for (s, r) in source_batches.iter().zip(replay_batches.iter()) {
        assert_eq!(s.symbol, r.symbol);
        assert_eq!(s.candles_json, r.candles_json);
        assert_ne!(s.batch_id, r.batch_id);
    }

    // Canonicalized news briefs agree on the evidence items.
    let source_brief = h
        .deps
        .artifacts()
        .get_latest(&source_run_id, "news_brief")
        .await
        .unwrap()
        .expect("source brief");
    let replay_brief = h
        .deps
        .artifacts()
        .get_latest(&replay_run_id, "news_brief")
        .await
        .unwrap()
        .expect("replay brief");
    assert_eq!(
        canonical_items(&source_brief),
        canonical_items(&replay_brief),
        "replay brief must reuse exactly the source evidence"
    );
}

/// Sorted (asset, item_id, title) triples from a brief.
fn canonical_items(brief: &serde_json::Value) -> Vec<(String, String, String)> {
    let mut items = Vec::new();
    if let Some(assets) = brief.get("assets").and_then(|a| a.as_array()) {
        for asset in assets {
            let symbol = asset.get("symbol").and_then(|s| s.as_str()).unwrap_or("").to_string();
            if let Some(clusters) = asset.get("clusters").and_then(|c| c.as_array()) {
                for cluster in clusters {
                    if let Some(rows) = cluster.get("items").and_then(|i| i.as_array()) {
                        for row in rows {
                            items.push((
                                symbol.clone(),
                                row.get("item_id").and_then(|i| i.as_str()).unwrap_or("").to_string(),
                                row.get("title").and_then(|t| t.as_str()).unwrap_or("").to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }
    items.sort();
    items
}
