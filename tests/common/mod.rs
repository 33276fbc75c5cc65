//! Shared harness for integration tests: a temp-file database, stub
//! market data with call counters, and settings tuned for fast paper
//! trades.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use execdesk_backend::api::AppState;
use execdesk_backend::config::Settings;
use execdesk_backend::db::Db;
use execdesk_backend::deps::Deps;
use execdesk_backend::market_data::StubMarketData;

pub struct TestHarness {
    pub state: AppState,
    pub deps: Deps,
    pub market: Arc<StubMarketData>,
    // Keeps the database file alive for the test's duration.
    _tempdir: tempfile::TempDir,
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::from_env();
    settings.trading_disable_live = true;
    settings.enable_live_trading = false;
    settings.execution_mode_default = "PAPER".to_string();
    settings.execution_timeout_seconds = 30;
    settings.max_notional_per_order_usd = 100.0;
    settings.max_trades_per_run = 1;
    settings.min_citations_required = 0;
    settings.force_paper_mode = false;
    settings.kill_switch_enabled = false;
    settings.symbol_allowlist = vec![
        "BTC".to_string(),
        "ETH".to_string(),
        "SOL".to_string(),
        "MATIC".to_string(),
        "AVAX".to_string(),
    ];
    settings
}

pub async fn harness() -> TestHarness {
    harness_with_settings(test_settings()).await
}

pub async fn harness_with_settings(settings: Settings) -> TestHarness {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("execdesk_test.db");
    let db = Db::open(db_path.to_str().unwrap()).expect("open db");
    db.init().await.expect("init db");

    let market = StubMarketData::new();
    market.set_series("BTC-USD", 100_000.0, 105_000.0);
    market.set_series("ETH-USD", 4_000.0, 4_040.0);
    market.set_series("SOL-USD", 200.0, 198.0);

    let deps = Deps::new(db, settings, market.clone());
    let state = AppState::new(deps.clone(), None);
    TestHarness {
        state,
        deps,
        market,
        _tempdir: tempdir,
    }
}

/// Seed a PENDING confirmation shaped like the chat layer's proposals.
pub async fn seed_confirmation(
    deps: &Deps,
    tenant_id: &str,
    mode: &str,
    asset: &str,
    amount_usd: f64,
    conversation_id: Option<&str>,
) -> String {
    let proposal = serde_json::json!({
        "side": "buy",
        "asset": asset,
        "amount_usd": amount_usd,
        "mode": mode,
        "is_most_profitable": false,
        "lookback_hours": 24,
        "news_enabled": true,
        "asset_class": "CRYPTO",
        "locked_product_id": format!("{asset}-USD"),
    });
    deps.confirmations()
        .create_pending(
            tenant_id,
            "u_test",
            conversation_id,
            &proposal.to_string(),
            None,
            mode,
            300,
        )
        .await
        .expect("create confirmation")
}

/// Poll the run until it is fully terminal: status COMPLETED/FAILED, the
/// RUN_COMPLETED/RUN_FAILED event persisted, and the trade receipt
/// written. The runner stamps the status before the trailing artifacts,
/// so waiting on the status alone races the worker.
pub async fn wait_for_terminal(deps: &Deps, run_id: &str, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        let status = deps
            .runs()
            .get(run_id)
            .await
            .expect("load run")
            .map(|r| r.status)
            .unwrap_or_default();
        if status == "COMPLETED" || status == "FAILED" {
            let events = deps.events().list_for_run(run_id).await.unwrap_or_default();
            let terminal_event = events
                .iter()
                .any(|e| e.event_type == "RUN_COMPLETED" || e.event_type == "RUN_FAILED");
            let receipt = deps
                .artifacts()
                .get_latest(run_id, "trade_receipt")
                .await
                .ok()
                .flatten();
            if terminal_event && receipt.is_some() {
                return status;
            }
        }
        assert!(
            Instant::now() < deadline,
            "run {run_id} did not reach a terminal state in time (last status: {status})"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the run parks in PAUSED (approval path).
pub async fn wait_for_paused(deps: &Deps, run_id: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let status = deps
            .runs()
            .get(run_id)
            .await
            .expect("load run")
            .map(|r| r.status)
            .unwrap_or_default();
        if status == "PAUSED" {
            return;
        }
        assert!(
            status != "COMPLETED" && status != "FAILED",
            "run {run_id} terminated ({status}) instead of pausing"
        );
        assert!(Instant::now() < deadline, "run {run_id} never paused");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
