//! End-to-end confirmation-gate scenarios over the library: the happy
//! paper trade, idempotent double confirm, and the LIVE kill switch.

mod common;

use std::time::Duration;

use common::{harness, seed_confirmation, wait_for_terminal};
use execdesk_backend::api::confirmations::confirm_impl;

#[tokio::test(flavor = "multi_thread")]
async fn happy_paper_trade_produces_filled_order_and_receipt() {
    let h = harness().await;
    let conf_id = seed_confirmation(&h.deps, "t_default", "PAPER", "BTC", 10.0, None).await;

    let response = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .expect("confirm succeeds");
    assert_eq!(response["status"], "EXECUTING");
    assert_eq!(response["confirmation_id"], conf_id.as_str());
    let run_id = response["run_id"].as_str().expect("run id").to_string();

    let status = wait_for_terminal(&h.deps, &run_id, Duration::from_secs(10)).await;
    assert_eq!(status, "COMPLETED");

    // Exactly one FILLED paper order with fill columns populated.
    let orders = h.deps.orders().list_for_run(&run_id).await.unwrap();
    assert_eq!(orders.len(), 1);
    let order = &orders[0];
    assert_eq!(order.status, "FILLED");
    assert_eq!(order.symbol, "BTC-USD");
    assert_eq!(order.side, "BUY");
    let expected_qty = 10.0 / 105_000.0;
    assert!((order.filled_qty.unwrap() - expected_qty).abs() < 1e-12);
    assert_eq!(order.avg_fill_price, Some(105_000.0));
    assert_eq!(order.total_fees, Some(0.0));
    assert!(order.status_updated_at.is_some());

    // At least two snapshots: pre-decision and post-trade.
    let snapshots = h.deps.portfolio().list_for_run(&run_id).await.unwrap();
    assert!(snapshots.len() >= 2, "expected >= 2 snapshots, got {}", snapshots.len());

    // Exactly one trade receipt, EXECUTED, with the paper venue facts.
    let artifacts = h.deps.artifacts().list(&run_id).await.unwrap();
    let receipts: Vec<_> = artifacts
        .iter()
        .filter(|a| a.artifact_type == "trade_receipt")
        .collect();
    assert_eq!(receipts.len(), 1);
    let receipt = &receipts[0].artifact_json;
    assert_eq!(receipt["status"], "EXECUTED");
    assert_eq!(receipt["mode"], "PAPER");
    assert_eq!(receipt["side"], "BUY");
    assert_eq!(receipt["symbol"], "BTC-USD");
    assert!(receipt["order_id"].as_str().unwrap().starts_with("ord_"));

    // The event log ends in RUN_COMPLETED and is ts-ordered.
    let events = h.deps.events().list_for_run(&run_id).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"PLAN_CREATED"));
    assert!(types.contains(&"RUN_STARTED"));
    assert!(types.contains(&"POLICY_DECISION"));
    assert_eq!(*types.last().unwrap(), "RUN_COMPLETED");
    let mut sorted = events.iter().map(|e| e.ts.clone()).collect::<Vec<_>>();
    sorted.sort();
    assert_eq!(sorted, events.iter().map(|e| e.ts.clone()).collect::<Vec<_>>());

    // Eval rows were written.
    let evals = h.deps.evals().list_for_run(&run_id).await.unwrap();
    let names: Vec<&str> = evals.iter().map(|e| e.eval_name.as_str()).collect();
    assert!(names.contains(&"execution_quality"));
    assert!(names.contains(&"run_state_consistency"));
    for eval in &evals {
        assert!((0.0..=1.0).contains(&eval.score));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn second_confirm_is_idempotent_and_returns_same_run() {
    let h = harness().await;
    let conf_id = seed_confirmation(&h.deps, "t_default", "PAPER", "BTC", 10.0, None).await;

    let first = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .expect("first confirm");
    let run_id = first["run_id"].as_str().unwrap().to_string();
    wait_for_terminal(&h.deps, &run_id, Duration::from_secs(10)).await;

    let second = confirm_impl(&h.state, "t_default", "u_test", "req_2", &conf_id)
        .await
        .expect("second confirm");
    assert_eq!(second["already_confirmed"], true);
    assert_eq!(second["status"], "CONFIRMED");
    assert_eq!(second["run_id"].as_str(), Some(run_id.as_str()));

    // Only one order row exists for the confirmation's run.
    let orders = h.deps.orders().list_for_run(&run_id).await.unwrap();
    assert_eq!(orders.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_confirms_create_exactly_one_run() {
    let h = harness().await;
    let conf_id = seed_confirmation(&h.deps, "t_default", "PAPER", "BTC", 10.0, None).await;

    let (a, b) = tokio::join!(
        confirm_impl(&h.state, "t_default", "u_test", "req_a", &conf_id),
        confirm_impl(&h.state, "t_default", "u_test", "req_b", &conf_id),
    );
    let a = a.expect("confirm a");
    let b = b.expect("confirm b");

    let executing = [&a, &b]
        .iter()
        .filter(|r| r["status"] == "EXECUTING")
        .count();
    assert_eq!(executing, 1, "exactly one confirm wins: {a} / {b}");

    // Exactly one run is linked to the confirmation.
    let confirmation = h
        .deps
        .confirmations()
        .get("t_default", &conf_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmation.status, "CONFIRMED");
    let run_id = confirmation.run_id.expect("run linked");
    wait_for_terminal(&h.deps, &run_id, Duration::from_secs(10)).await;
    let runs = h.deps.runs().list("t_default", 50).await.unwrap();
    assert_eq!(runs.len(), 1, "a second run must never be created");
}

#[tokio::test(flavor = "multi_thread")]
async fn live_disabled_blocks_cleanly_without_side_effects() {
    let h = harness().await;
    let conf_id = seed_confirmation(&h.deps, "t_default", "LIVE", "BTC", 10.0, None).await;

    let err = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .expect_err("LIVE confirm must be rejected");
    assert_eq!(err.status, axum::http::StatusCode::FORBIDDEN);
    assert_eq!(err.code, "LIVE_DISABLED");
    assert!(err.remediation.as_deref().unwrap().contains("TRADING_DISABLE_LIVE"));

    // The confirmation is untouched and no run exists.
    let confirmation = h
        .deps
        .confirmations()
        .get("t_default", &conf_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmation.status, "PENDING");
    assert!(confirmation.run_id.is_none());
    assert!(h.deps.runs().list("t_default", 50).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_confirmation_is_marked_and_rejected() {
    let h = harness().await;
    let proposal = serde_json::json!({
        "side": "buy", "asset": "BTC", "amount_usd": 10.0, "mode": "PAPER",
        "lookback_hours": 24, "news_enabled": true, "asset_class": "CRYPTO",
    });
    let conf_id = h
        .deps
        .confirmations()
        .create_pending("t_default", "u_test", None, &proposal.to_string(), None, "PAPER", -10)
        .await
        .unwrap();

    let response = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .expect("expiry is a clean response, not an error");
    assert_eq!(response["status"], "EXPIRED");
    let row = h
        .deps
        .confirmations()
        .get("t_default", &conf_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "EXPIRED");
}

#[tokio::test(flavor = "multi_thread")]
async fn active_run_guard_returns_conflict() {
    let h = harness().await;
    // A lingering RUNNING run in the same conversation blocks new confirms.
    let active = h
        .deps
        .runs()
        .create("t_default", "PAPER", None, Some("conv_1"))
        .await
        .unwrap();
    h.deps
        .runs()
        .update_status(
            &active,
            execdesk_backend::state_machine::RunStatus::Running,
            Some(execdesk_backend::ids::now_iso()),
            None,
            None,
        )
        .await
        .unwrap();

    let conf_id = seed_confirmation(&h.deps, "t_default", "PAPER", "BTC", 10.0, Some("conv_1")).await;
    let err = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .expect_err("guard must reject");
    assert_eq!(err.status, axum::http::StatusCode::CONFLICT);
    assert_eq!(err.code, "RUN_ALREADY_ACTIVE");
}
