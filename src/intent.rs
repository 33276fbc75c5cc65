//! Deterministic natural-language command parsing.
//!
//! Classifies chat input (greeting / capabilities / out-of-scope /
//! analytics / replay / trade) and extracts a `TradeIntent` for trade
//! commands: side, budget, ranking metric, lookback window, and universe.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::TradeIntent;

pub const DEFAULT_BUDGET_USD: f64 = 10.0;
pub const DEFAULT_UNIVERSE: &[&str] =
    &["BTC-USD", "ETH-USD", "SOL-USD", "MATIC-USD", "AVAX-USD"];

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Greeting,
    Capabilities,
    PortfolioAnalysis,
    Analytics,
    Replay { source_run_id: String },
    Trade(Box<ParsedTrade>),
    OutOfScope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTrade {
    pub intent: TradeIntent,
    /// True when no concrete symbol was named ("most profitable crypto").
    pub is_most_profitable: bool,
    /// Named asset base symbol when one was given, e.g. "BTC".
    pub asset: Option<String>,
}

lazy_static! {
    static ref RE_BUDGET_DOLLARS: Regex = Regex::new(r"\$(\d+(?:\.\d+)?)").unwrap();
    static ref RE_BUDGET_WORDS: Regex =
        Regex::new(r"(\d+(?:\.\d+)?)\s*(?:dollar|usd|us\s*dollar)").unwrap();
    static ref RE_REPLAY: Regex = Regex::new(r"replay run\s+([a-zA-Z0-9_-]+)").unwrap();
}

const SYMBOL_LEXICON: &[(&str, &str)] = &[
    ("bitcoin", "BTC"),
    ("btc", "BTC"),
    ("ethereum", "ETH"),
    ("eth", "ETH"),
    ("solana", "SOL"),
    ("sol", "SOL"),
    ("polygon", "MATIC"),
    ("matic", "MATIC"),
    ("avalanche", "AVAX"),
    ("avax", "AVAX"),
    ("dogecoin", "DOGE"),
    ("doge", "DOGE"),
    ("litecoin", "LTC"),
    ("ltc", "LTC"),
];

const GREETINGS: &[&str] = &["hi", "hello", "hey", "good morning", "good afternoon", "yo"];

/// Classify a chat command.
pub fn classify(text: &str) -> CommandKind {
    let lower = text.to_lowercase();
    let trimmed = lower.trim().trim_end_matches(['!', '.', '?']);

    if GREETINGS.iter().any(|g| trimmed == *g) {
        return CommandKind::Greeting;
    }
    if trimmed.contains("what can you do") || trimmed.contains("help") || trimmed.contains("capabilit") {
        return CommandKind::Capabilities;
    }
    if let Some(caps) = RE_REPLAY.captures(trimmed) {
        return CommandKind::Replay {
            source_run_id: caps[1].to_string(),
        };
    }
    if trimmed.contains("show") && trimmed.contains("performance") {
        return CommandKind::Analytics;
    }
    if trimmed.contains("analyze") && trimmed.contains("portfolio") {
        return CommandKind::PortfolioAnalysis;
    }
    if trimmed.contains("buy") || trimmed.contains("sell") || trimmed.contains("purchase") {
        return CommandKind::Trade(Box::new(parse_trade(text, DEFAULT_BUDGET_USD)));
    }
    CommandKind::OutOfScope
}

/// Extract a `TradeIntent` from a trade-shaped command.
pub fn parse_trade(text: &str, default_budget: f64) -> ParsedTrade {
    let lower = text.to_lowercase();

    let side = if lower.contains("sell") { "SELL" } else { "BUY" };

    let budget = RE_BUDGET_DOLLARS
        .captures(text)
        .or_else(|| RE_BUDGET_WORDS.captures(&lower))
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(default_budget);

    let metric = if lower.contains("sharpe") || lower.contains("risk-adjusted") {
        "sharpe_proxy"
    } else if lower.contains("momentum") {
        "momentum"
    } else {
        "return"
    };

    let (window, lookback_hours) = if lower.contains("1h") || lower.contains("1 hour") {
        ("1h", 1)
    } else if lower.contains("7d") || lower.contains("7 day") || lower.contains("week") {
        ("7d", 168)
    } else {
        ("24h", 24)
    };

    let mut found: Vec<String> = Vec::new();
    for (word, symbol) in SYMBOL_LEXICON {
        if lower.contains(word) && !found.iter().any(|s| s == symbol) {
            found.push(symbol.to_string());
        }
    }

    let is_most_profitable = found.is_empty()
        && (lower.contains("most profitable") || lower.contains("best") || lower.contains("top"));

    let (universe, asset) = if let Some(first) = found.first() {
        (vec![format!("{first}-USD")], Some(first.clone()))
    } else {
        (
            DEFAULT_UNIVERSE.iter().map(|s| s.to_string()).collect(),
            None,
        )
    };

    let order_type = if lower.contains("limit") { "limit" } else { "market" };

    ParsedTrade {
        intent: TradeIntent {
            side: side.to_string(),
            budget_usd: budget,
            metric: metric.to_string(),
            window: window.to_string(),
            lookback_hours,
            universe,
            raw_command: text.to_string(),
            constraints: serde_json::json!({ "order_type": order_type }),
        },
        is_most_profitable,
        asset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_classified() {
        assert_eq!(classify("Hello!"), CommandKind::Greeting);
        assert_eq!(classify("hey"), CommandKind::Greeting);
    }

    #[test]
    fn test_replay_command() {
        match classify("replay run run_abc123") {
            CommandKind::Replay { source_run_id } => assert_eq!(source_run_id, "run_abc123"),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn test_direct_buy_parsed() {
        match classify("Buy $10 of BTC") {
            CommandKind::Trade(parsed) => {
                assert_eq!(parsed.intent.side, "BUY");
                assert_eq!(parsed.intent.budget_usd, 10.0);
                assert_eq!(parsed.intent.universe, vec!["BTC-USD"]);
                assert_eq!(parsed.asset.as_deref(), Some("BTC"));
                assert!(!parsed.is_most_profitable);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_sell_with_dollar_amount() {
        match classify("sell $2 of BTC") {
            CommandKind::Trade(parsed) => {
                assert_eq!(parsed.intent.side, "SELL");
                assert_eq!(parsed.intent.budget_usd, 2.0);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_most_profitable_keeps_default_universe() {
        match classify("buy the most profitable crypto of last 24hrs for $10") {
            CommandKind::Trade(parsed) => {
                assert!(parsed.is_most_profitable);
                assert!(parsed.asset.is_none());
                assert_eq!(parsed.intent.universe.len(), DEFAULT_UNIVERSE.len());
                assert_eq!(parsed.intent.window, "24h");
                assert_eq!(parsed.intent.lookback_hours, 24);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_week_window() {
        match classify("buy the best crypto of the week for $5") {
            CommandKind::Trade(parsed) => {
                assert_eq!(parsed.intent.window, "7d");
                assert_eq!(parsed.intent.lookback_hours, 168);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_scope() {
        assert_eq!(classify("write me a poem about rust"), CommandKind::OutOfScope);
    }
}
