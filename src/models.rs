//! Shared domain types: execution modes, sides, order lifecycle, and the
//! parsed `TradeIntent` the orchestrator consumes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[serde(rename = "PAPER")]
    Paper,
    #[serde(rename = "LIVE")]
    Live,
    #[serde(rename = "REPLAY")]
    Replay,
    #[serde(rename = "ASSISTED_LIVE")]
    AssistedLive,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Paper => "PAPER",
            ExecutionMode::Live => "LIVE",
            ExecutionMode::Replay => "REPLAY",
            ExecutionMode::AssistedLive => "ASSISTED_LIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PAPER" => Some(ExecutionMode::Paper),
            "LIVE" => Some(ExecutionMode::Live),
            "REPLAY" => Some(ExecutionMode::Replay),
            "ASSISTED_LIVE" => Some(ExecutionMode::AssistedLive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "MARKET_BUY" => Some(Side::Buy),
            "SELL" | "MARKET_SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetClass {
    #[serde(rename = "CRYPTO")]
    Crypto,
    #[serde(rename = "STOCK")]
    Stock,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Crypto => "CRYPTO",
            AssetClass::Stock => "STOCK",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("STOCK") {
            AssetClass::Stock
        } else {
            AssetClass::Crypto
        }
    }
}

/// Order statuses that no longer change. Order rows only move toward one
/// of these.
pub const TERMINAL_ORDER_STATUSES: &[&str] = &[
    "FILLED", "FAILED", "REJECTED", "CANCELED", "EXPIRED", "TIMEOUT",
];

pub fn is_terminal_order_status(status: &str) -> bool {
    TERMINAL_ORDER_STATUSES.contains(&status.to_uppercase().as_str())
}

/// Parsed intent of a trade command. Produced by the command parser (or an
/// upstream service) and consumed by the orchestrator; persisted on the run
/// as `parsed_intent_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub side: String,
    pub budget_usd: f64,
    /// Ranking metric, e.g. "return".
    pub metric: String,
    /// Window label, e.g. "24h", "7d".
    pub window: String,
    pub lookback_hours: i64,
    /// Product ids to research, e.g. ["BTC-USD"].
    pub universe: Vec<String>,
    pub raw_command: String,
    #[serde(default)]
    pub constraints: serde_json::Value,
}

impl TradeIntent {
    pub fn side_enum(&self) -> Side {
        Side::parse(&self.side).unwrap_or(Side::Buy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_mode_round_trip() {
        for s in ["PAPER", "LIVE", "REPLAY", "ASSISTED_LIVE"] {
            assert_eq!(ExecutionMode::parse(s).unwrap().as_str(), s);
        }
        assert!(ExecutionMode::parse("YOLO").is_none());
    }

    #[test]
    fn test_terminal_order_statuses() {
        assert!(is_terminal_order_status("FILLED"));
        assert!(is_terminal_order_status("timeout"));
        assert!(!is_terminal_order_status("SUBMITTED"));
        assert!(!is_terminal_order_status("OPEN"));
    }
}
