//! Structured trade error codes.
//!
//! Nodes raise `TradeError` for domain failures so the runner can stamp a
//! machine-readable code onto the failed node, the trade receipt, and the
//! `RUN_FAILED` event. Anything else is mapped from the error message or
//! falls back to the error type name.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeErrorCode {
    #[serde(rename = "EXECUTION_TIMEOUT")]
    ExecutionTimeout,
    #[serde(rename = "PRODUCT_DETAILS_UNAVAILABLE")]
    ProductDetailsUnavailable,
    #[serde(rename = "PRODUCT_API_RATE_LIMITED")]
    ProductApiRateLimited,
    #[serde(rename = "USER_REJECTED")]
    UserRejected,
    #[serde(rename = "INSUFFICIENT_BALANCE")]
    InsufficientBalance,
    #[serde(rename = "MIN_NOTIONAL_TOO_HIGH")]
    MinNotionalTooHigh,
    #[serde(rename = "POLICY_BLOCKED")]
    PolicyBlocked,
    #[serde(rename = "PROPOSAL_BLOCKED")]
    ProposalBlocked,
    #[serde(rename = "LIVE_DISABLED")]
    LiveDisabled,
}

impl TradeErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeErrorCode::ExecutionTimeout => "EXECUTION_TIMEOUT",
            TradeErrorCode::ProductDetailsUnavailable => "PRODUCT_DETAILS_UNAVAILABLE",
            TradeErrorCode::ProductApiRateLimited => "PRODUCT_API_RATE_LIMITED",
            TradeErrorCode::UserRejected => "USER_REJECTED",
            TradeErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            TradeErrorCode::MinNotionalTooHigh => "MIN_NOTIONAL_TOO_HIGH",
            TradeErrorCode::PolicyBlocked => "POLICY_BLOCKED",
            TradeErrorCode::ProposalBlocked => "PROPOSAL_BLOCKED",
            TradeErrorCode::LiveDisabled => "LIVE_DISABLED",
        }
    }

    /// Operator-facing remediation hint, rendered next to the error message.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            TradeErrorCode::ExecutionTimeout => {
                Some("Retry the command; raise EXECUTION_TIMEOUT_SECONDS if runs routinely exceed the deadline.")
            }
            TradeErrorCode::ProductDetailsUnavailable => {
                Some("The venue catalog did not return this product. Verify the symbol or retry later.")
            }
            TradeErrorCode::ProductApiRateLimited => {
                Some("The venue is rate limiting market-data calls. Wait a minute and retry.")
            }
            TradeErrorCode::UserRejected => None,
            TradeErrorCode::InsufficientBalance => {
                Some("Reduce the order notional or fund the account.")
            }
            TradeErrorCode::MinNotionalTooHigh => {
                Some("Orders must be at least $1. Increase the budget.")
            }
            TradeErrorCode::PolicyBlocked => {
                Some("Review the policy reasons on the run; adjust limits or the allowlist if intended.")
            }
            TradeErrorCode::ProposalBlocked => None,
            TradeErrorCode::LiveDisabled => Some(
                "Set TRADING_DISABLE_LIVE=false and ENABLE_LIVE_TRADING=true in your environment, then restart the backend.",
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeError {
    pub code: TradeErrorCode,
    pub message: String,
}

impl TradeError {
    pub fn new(code: TradeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn to_error_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "remediation": self.code.remediation(),
        })
    }
}

impl fmt::Display for TradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for TradeError {}

/// Derive a structured error code from an arbitrary node error: a
/// `TradeError` keeps its own code, otherwise the message is matched
/// against known failure shapes.
pub fn classify_error(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(te) = err.downcast_ref::<TradeError>() {
        return Some(te.code.as_str());
    }
    let msg = err.to_string().to_lowercase();
    if msg.contains("product details unavailable") {
        Some("PRODUCT_DETAILS_UNAVAILABLE")
    } else if msg.contains("timeout") {
        Some("EXECUTION_TIMEOUT")
    } else if msg.contains("rate limit") {
        Some("PRODUCT_API_RATE_LIMITED")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_trade_error() {
        let err = anyhow::Error::new(TradeError::new(TradeErrorCode::UserRejected, "no"));
        assert_eq!(classify_error(&err), Some("USER_REJECTED"));
    }

    #[test]
    fn test_classify_from_message() {
        let err = anyhow::anyhow!("candle fetch hit a rate limit (429)");
        assert_eq!(classify_error(&err), Some("PRODUCT_API_RATE_LIMITED"));
        let err = anyhow::anyhow!("operation timeout exceeded");
        assert_eq!(classify_error(&err), Some("EXECUTION_TIMEOUT"));
        let err = anyhow::anyhow!("something else entirely");
        assert_eq!(classify_error(&err), None);
    }

    #[test]
    fn test_live_disabled_has_remediation() {
        assert!(TradeErrorCode::LiveDisabled.remediation().unwrap().contains("TRADING_DISABLE_LIVE"));
    }
}
