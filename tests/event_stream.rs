//! Event-stream contract: a subscriber attached before the run starts
//! sees every persisted event, in `ts` order.

mod common;

use std::time::Duration;

use common::{harness, wait_for_terminal};
use execdesk_backend::models::TradeIntent;
use execdesk_backend::orchestrator::runner;

#[tokio::test(flavor = "multi_thread")]
async fn live_subscriber_sees_the_full_event_log() {
    let h = harness().await;
    let run_id = runner::create_run(&h.deps, "t_default", "PAPER", None, None)
        .await
        .unwrap();
    let intent = TradeIntent {
        side: "BUY".to_string(),
        budget_usd: 10.0,
        metric: "return".to_string(),
        window: "24h".to_string(),
        lookback_hours: 24,
        universe: vec!["BTC-USD".to_string()],
        raw_command: "Buy $10 of BTC".to_string(),
        constraints: serde_json::json!({}),
    };
    h.deps
        .runs()
        .set_trade_fields(
            &run_id,
            "Buy $10 of BTC",
            "{}",
            &serde_json::to_string(&intent).unwrap(),
            "{}",
            true,
            "CRYPTO",
            Some("BTC-USD"),
            None,
        )
        .await
        .unwrap();

    // Subscribe before the runner emits anything.
    let mut subscription = h.deps.bus.subscribe(&run_id);
    runner::execute_run(&h.deps, &run_id).await.unwrap();
    let status = wait_for_terminal(&h.deps, &run_id, Duration::from_secs(10)).await;
    assert_eq!(status, "COMPLETED");

    let mut delivered = Vec::new();
    while let Ok(envelope) = subscription.rx.try_recv() {
        delivered.push((envelope.event_type, envelope.ts));
    }
    h.deps.bus.unsubscribe(&run_id, &subscription.id);

    let persisted = h.deps.events().list_for_run(&run_id).await.unwrap();
    assert!(!persisted.is_empty());
    assert_eq!(
        delivered.len(),
        persisted.len(),
        "every persisted event is delivered live"
    );
    for (delivered, persisted) in delivered.iter().zip(persisted.iter()) {
        assert_eq!(delivered.0, persisted.event_type);
        assert_eq!(delivered.1, persisted.ts);
    }

    // Persisted order is ts order, ending in RUN_COMPLETED.
    let mut ts: Vec<&String> = persisted.iter().map(|e| &e.ts).collect();
    let original = ts.clone();
    ts.sort();
    assert_eq!(ts, original);
    assert_eq!(persisted.last().unwrap().event_type, "RUN_COMPLETED");
}
