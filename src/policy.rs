//! Deterministic pre-trade policy check.
//!
//! Pure function of its arguments; the tenant kill-switch flag is looked
//! up by the caller. The order of checks is fixed: kill switches, symbol
//! allowlist (bypassed for system-selected, tradability-verified assets),
//! per-order notional, the 80% approval band, per-run order cap, citation
//! minimum, and finally the LIVE approval requirement.

use serde::{Deserialize, Serialize};

use crate::config::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyOutcome {
    #[serde(rename = "ALLOWED")]
    Allowed,
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[serde(rename = "REQUIRES_APPROVAL")]
    RequiresApproval,
}

impl PolicyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyOutcome::Allowed => "ALLOWED",
            PolicyOutcome::Blocked => "BLOCKED",
            PolicyOutcome::RequiresApproval => "REQUIRES_APPROVAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub decision: PolicyOutcome,
    pub reasons: Vec<String>,
}

pub fn check_policy(
    settings: &Settings,
    tenant_kill_switch: bool,
    proposal: &serde_json::Value,
    existing_order_count: i64,
    execution_mode: &str,
) -> PolicyDecision {
    let mut reasons = Vec::new();
    let mut decision = PolicyOutcome::Allowed;

    if settings.kill_switch_enabled || tenant_kill_switch {
        return PolicyDecision {
            decision: PolicyOutcome::Blocked,
            reasons: vec!["Kill switch enabled".to_string()],
        };
    }

    // System-selected assets passed a live tradability preflight; the
    // static allowlist does not apply to them.
    let chosen_product_id = proposal
        .get("chosen_product_id")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let is_system_selected = !chosen_product_id.is_empty()
        && proposal
            .get("tradability_verified")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

    let orders = proposal
        .get("orders")
        .and_then(|o| o.as_array())
        .cloned()
        .unwrap_or_default();
    let citations = proposal
        .get("citations")
        .and_then(|c| c.as_array())
        .map(|c| c.len())
        .unwrap_or(0);

    for order in &orders {
        let symbol = order
            .get("symbol")
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_uppercase();
        let symbol_base = symbol.trim_end_matches("-USD").to_string();
        let notional = order
            .get("notional_usd")
            .and_then(|n| n.as_f64())
            .unwrap_or(0.0);

        let allowlisted = settings.symbol_allowlist.iter().any(|s| s == &symbol_base);
        if !allowlisted && !is_system_selected {
            reasons.push(format!(
                "Symbol {symbol_base} not in allowlist: {:?}",
                settings.symbol_allowlist
            ));
            decision = PolicyOutcome::Blocked;
        } else if !allowlisted && is_system_selected {
            reasons.push(format!(
                "Symbol {symbol_base} auto-selected by system (tradability pre-verified)"
            ));
        }

        if notional > settings.max_notional_per_order_usd {
            reasons.push(format!(
                "Notional {notional} exceeds limit {}",
                settings.max_notional_per_order_usd
            ));
            decision = PolicyOutcome::Blocked;
        }

        if notional >= 0.8 * settings.max_notional_per_order_usd
            && decision != PolicyOutcome::Blocked
        {
            decision = PolicyOutcome::RequiresApproval;
            reasons.push(format!(
                "Notional {notional} is >= 80% of limit {}",
                settings.max_notional_per_order_usd
            ));
        }
    }

    let total_orders = existing_order_count + orders.len() as i64;
    if total_orders > settings.max_trades_per_run {
        reasons.push(format!(
            "Total orders {total_orders} exceeds limit {}",
            settings.max_trades_per_run
        ));
        decision = PolicyOutcome::Blocked;
    }

    let skip_citations = proposal
        .get("skip_citation_check")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if citations < settings.min_citations_required && !skip_citations {
        reasons.push(format!(
            "Citations {citations} below required {}",
            settings.min_citations_required
        ));
        decision = PolicyOutcome::Blocked;
    }

    if execution_mode == "LIVE" && decision == PolicyOutcome::Allowed {
        decision = PolicyOutcome::RequiresApproval;
        reasons.push("LIVE trading mode requires approval".to_string());
    }

    PolicyDecision { decision, reasons }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut s = Settings::from_env();
        s.kill_switch_enabled = false;
        s.max_notional_per_order_usd = 100.0;
        s.max_trades_per_run = 1;
        s.min_citations_required = 0;
        s.symbol_allowlist = vec!["BTC".to_string(), "ETH".to_string()];
        s
    }

    fn proposal(symbol: &str, notional: f64) -> serde_json::Value {
        serde_json::json!({
            "orders": [{"symbol": symbol, "side": "BUY", "notional_usd": notional}],
            "citations": [],
            "chosen_product_id": "",
            "skip_citation_check": true,
        })
    }

    #[test]
    fn test_allowed_within_limits() {
        let d = check_policy(&settings(), false, &proposal("BTC", 10.0), 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Allowed);
    }

    #[test]
    fn test_kill_switch_blocks_first() {
        let mut s = settings();
        s.kill_switch_enabled = true;
        let d = check_policy(&s, false, &proposal("BTC", 10.0), 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Blocked);
        assert_eq!(d.reasons, vec!["Kill switch enabled"]);
        // Tenant switch has the same effect.
        let d = check_policy(&settings(), true, &proposal("BTC", 10.0), 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Blocked);
    }

    #[test]
    fn test_allowlist_blocks_unknown_symbol() {
        let d = check_policy(&settings(), false, &proposal("HNT", 10.0), 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Blocked);
        assert!(d.reasons[0].contains("not in allowlist"));
    }

    #[test]
    fn test_tradability_verified_bypasses_allowlist() {
        let mut p = proposal("HNT-USD", 10.0);
        p["chosen_product_id"] = serde_json::json!("HNT-USD");
        p["tradability_verified"] = serde_json::json!(true);
        let d = check_policy(&settings(), false, &p, 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Allowed);
        assert!(d.reasons[0].contains("tradability pre-verified"));
    }

    #[test]
    fn test_over_limit_blocks() {
        let d = check_policy(&settings(), false, &proposal("BTC", 150.0), 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Blocked);
    }

    #[test]
    fn test_eighty_percent_band_requires_approval() {
        let d = check_policy(&settings(), false, &proposal("BTC", 85.0), 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::RequiresApproval);
    }

    #[test]
    fn test_order_cap_blocks() {
        let d = check_policy(&settings(), false, &proposal("BTC", 10.0), 1, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Blocked);
        assert!(d.reasons.iter().any(|r| r.contains("Total orders")));
    }

    #[test]
    fn test_citations_enforced_unless_opted_out() {
        let mut s = settings();
        s.min_citations_required = 2;
        let mut p = proposal("BTC", 10.0);
        p["skip_citation_check"] = serde_json::json!(false);
        let d = check_policy(&s, false, &p, 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Blocked);
        p["skip_citation_check"] = serde_json::json!(true);
        let d = check_policy(&s, false, &p, 0, "PAPER");
        assert_eq!(d.decision, PolicyOutcome::Allowed);
    }

    #[test]
    fn test_live_requires_approval() {
        let d = check_policy(&settings(), false, &proposal("BTC", 10.0), 0, "LIVE");
        assert_eq!(d.decision, PolicyOutcome::RequiresApproval);
        assert!(d.reasons.iter().any(|r| r.contains("LIVE")));
    }
}
