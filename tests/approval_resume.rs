//! Approval pause/resume: a notional at >= 80% of the per-order limit
//! parks the run in PAUSED; the decision re-enters the runner, which
//! skips completed nodes and finishes the trade.

mod common;

use std::time::Duration;

use common::{harness, seed_confirmation, wait_for_paused, wait_for_terminal};
use execdesk_backend::api::confirmations::confirm_impl;
use execdesk_backend::ids::now_iso;
use execdesk_backend::orchestrator::runner;
use execdesk_backend::state_machine::RunStatus;

#[tokio::test(flavor = "multi_thread")]
async fn run_pauses_then_resumes_after_approval() {
    let h = harness().await;
    // $85 against a $100 limit lands in the 80% approval band.
    let conf_id = seed_confirmation(&h.deps, "t_default", "PAPER", "BTC", 85.0, None).await;
    let response = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .unwrap();
    let run_id = response["run_id"].as_str().unwrap().to_string();

    wait_for_paused(&h.deps, &run_id, Duration::from_secs(10)).await;

    // APPROVAL_REQUESTED was emitted and a PENDING approval row exists.
    let events = h.deps.events().list_for_run(&run_id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "APPROVAL_REQUESTED"));
    let approval = h
        .deps
        .approvals()
        .latest_for_run(&run_id)
        .await
        .unwrap()
        .expect("approval row");
    assert_eq!(approval.status, "PENDING");

    let nodes_before: Vec<String> = h
        .deps
        .nodes()
        .list(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.node_id)
        .collect();

    // Approve and re-enter the runner the way the endpoint does.
    assert!(h
        .deps
        .approvals()
        .decide(&approval.approval_id, "APPROVED", "u_test")
        .await
        .unwrap());
    h.deps
        .runs()
        .update_status(&run_id, RunStatus::Running, None, None, None)
        .await
        .unwrap();
    runner::execute_run(&h.deps, &run_id).await.unwrap();

    let status = wait_for_terminal(&h.deps, &run_id, Duration::from_secs(10)).await;
    assert_eq!(status, "COMPLETED");

    // Pre-approval nodes were skipped, not re-executed: their rows are the
    // same and each pre-pause name still appears exactly once.
    let nodes_after = h.deps.nodes().list(&run_id).await.unwrap();
    for node_id in &nodes_before {
        assert!(nodes_after.iter().any(|n| &n.node_id == node_id));
    }
    let research_rows = nodes_after.iter().filter(|n| n.name == "research").count();
    assert_eq!(research_rows, 1, "research must not run twice on resume");

    // The trade executed.
    let receipt = h
        .deps
        .artifacts()
        .get_latest(&run_id, "trade_receipt")
        .await
        .unwrap()
        .expect("receipt");
    assert_eq!(receipt["status"], "EXECUTED");
    let orders = h.deps.orders().list_for_run(&run_id).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, "FILLED");
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_approval_fails_run_with_user_rejected() {
    let h = harness().await;
    let conf_id = seed_confirmation(&h.deps, "t_default", "PAPER", "BTC", 85.0, None).await;
    let response = confirm_impl(&h.state, "t_default", "u_test", "req_1", &conf_id)
        .await
        .unwrap();
    let run_id = response["run_id"].as_str().unwrap().to_string();
    wait_for_paused(&h.deps, &run_id, Duration::from_secs(10)).await;

    let approval = h
        .deps
        .approvals()
        .latest_for_run(&run_id)
        .await
        .unwrap()
        .unwrap();
    assert!(h
        .deps
        .approvals()
        .decide(&approval.approval_id, "REJECTED", "u_test")
        .await
        .unwrap());
    // Mirror the endpoint's rejection path.
    h.deps
        .runs()
        .update_status(&run_id, RunStatus::Failed, None, Some(now_iso()), None)
        .await
        .unwrap();
    h.deps
        .runs()
        .set_failure(&run_id, "user rejected trade proposal", Some("USER_REJECTED"))
        .await
        .unwrap();
    runner::build_trade_receipt(
        &h.deps,
        &run_id,
        "FAILED",
        Some(serde_json::json!({"code": "USER_REJECTED", "message": "User rejected the trade proposal"})),
    )
    .await
    .unwrap();

    let run = h.deps.runs().get(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "FAILED");
    assert_eq!(run.failure_code.as_deref(), Some("USER_REJECTED"));
    let receipt = h
        .deps
        .artifacts()
        .get_latest(&run_id, "trade_receipt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(receipt["status"], "FAILED");
    assert_eq!(receipt["error"]["code"], "USER_REJECTED");
    assert!(h.deps.orders().list_for_run(&run_id).await.unwrap().is_empty());
}
