//! Critical news gate: a security headline inside the lookback blocks a
//! BUY before any order is created.

mod common;

use std::time::Duration;

use common::{harness, seed_confirmation, wait_for_terminal};
use execdesk_backend::api::confirmations::confirm_impl;

#[tokio::test(flavor = "multi_thread")]
async fn critical_headline_blocks_buy_with_no_order() {
    let h = harness().await;
    h.deps
        .evidence()
        .insert_news_item(
            "BTC bridge attack drains reserves",
            "BTC",
            &execdesk_backend::ids::now_iso(),
            None,
        )
        .await
        .unwrap();

    let conf_id = seed_confirmation(&h.deps, "t_default", "PAPER", "BTC", 10.0, None).await;
    let response = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .unwrap();
    let run_id = response["run_id"].as_str().unwrap().to_string();
    let status = wait_for_terminal(&h.deps, &run_id, Duration::from_secs(10)).await;
    assert_eq!(status, "FAILED", "blocked proposal fails the run at execution");

    // No order row was ever created.
    assert!(h.deps.orders().list_for_run(&run_id).await.unwrap().is_empty());

    // The decision table records the block.
    let table = h
        .deps
        .artifacts()
        .get_latest(&run_id, "decision_table")
        .await
        .unwrap()
        .expect("decision_table");
    assert_eq!(table["final_selection"]["blocked"], true);
    assert_eq!(table["final_selection"]["block_reason"], "bridge attack");

    // The receipt is FAILED and carries the block rationale.
    let receipt = h
        .deps
        .artifacts()
        .get_latest(&run_id, "trade_receipt")
        .await
        .unwrap()
        .expect("trade_receipt");
    assert_eq!(receipt["status"], "FAILED");
    assert_eq!(receipt["error"]["code"], "PROPOSAL_BLOCKED");

    // The proposal itself shows empty orders and zero confidence.
    let run = h.deps.runs().get(&run_id).await.unwrap().unwrap();
    let proposal: serde_json::Value =
        serde_json::from_str(run.trade_proposal_json.as_deref().unwrap()).unwrap();
    assert!(proposal["orders"].as_array().unwrap().is_empty());
    assert_eq!(proposal["confidence"], 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn bearish_headlines_do_not_block_sell() {
    let h = harness().await;
    for title in [
        "BTC crash wipes out leveraged longs",
        "BTC collapse continues as funds flee",
        "Another BTC selloff hits miners",
    ] {
        h.deps
            .evidence()
            .insert_news_item(title, "BTC", &execdesk_backend::ids::now_iso(), None)
            .await
            .unwrap();
    }

    // Seed a position so the sell is meaningful for ledger math.
    let proposal = serde_json::json!({
        "side": "sell",
        "asset": "BTC",
        "amount_usd": 5.0,
        "mode": "PAPER",
        "lookback_hours": 24,
        "news_enabled": true,
        "asset_class": "CRYPTO",
        "locked_product_id": "BTC-USD",
    });
    let conf_id = h
        .deps
        .confirmations()
        .create_pending("t_default", "u_test", None, &proposal.to_string(), None, "PAPER", 300)
        .await
        .unwrap();
    let response = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .unwrap();
    let run_id = response["run_id"].as_str().unwrap().to_string();
    let status = wait_for_terminal(&h.deps, &run_id, Duration::from_secs(10)).await;
    assert_eq!(status, "COMPLETED", "bearish news supports the SELL");

    let orders = h.deps.orders().list_for_run(&run_id).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, "SELL");
}
