//! Node stages of the run DAG.
//!
//! Nodes are a tagged enum dispatched in a match so the execution order
//! stays deterministic and visible in one place. Each node receives the
//! shared `Deps` plus its `(run_id, node_id, tenant_id)` context, loads
//! what it needs from prior node outputs, and is responsible for its own
//! evidence, artifacts, and tool-call rows.

pub mod approval;
pub mod eval;
pub mod execution;
pub mod news;
pub mod policy_check;
pub mod post_trade;
pub mod proposal;
pub mod research;
pub mod risk;
pub mod signals;

use anyhow::Result;
use serde_json::Value;

use crate::deps::Deps;

#[derive(Debug, Clone)]
pub struct NodeCtx {
    pub run_id: String,
    pub node_id: String,
    pub tenant_id: String,
}

/// What a node hands back to the runner.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub outputs: Value,
    pub requires_approval: bool,
    pub approval_id: Option<String>,
    pub evidence_refs: Value,
    pub safe_summary: String,
}

impl NodeOutput {
    pub fn from_outputs(outputs: Value, safe_summary: impl Into<String>) -> Self {
        Self {
            outputs,
            requires_approval: false,
            approval_id: None,
            evidence_refs: Value::Array(Vec::new()),
            safe_summary: safe_summary.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Research,
    News,
    Signals,
    Risk,
    Proposal,
    PolicyCheck,
    Approval,
    Execution,
    PostTrade,
    Eval,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Research => "research",
            NodeKind::News => "news",
            NodeKind::Signals => "signals",
            NodeKind::Risk => "risk",
            NodeKind::Proposal => "proposal",
            NodeKind::PolicyCheck => "policy_check",
            NodeKind::Approval => "approval",
            NodeKind::Execution => "execution",
            NodeKind::PostTrade => "post_trade",
            NodeKind::Eval => "eval",
        }
    }

    pub fn description(&self, asset_class: &str, execution_mode: &str) -> &'static str {
        match self {
            NodeKind::Research => {
                if asset_class == "STOCK" {
                    "Fetch stock data (EOD)"
                } else {
                    "Fetch market data for universe"
                }
            }
            NodeKind::News => "Analyze news sentiment",
            NodeKind::Signals => {
                if asset_class == "STOCK" {
                    "Rank by EOD return"
                } else {
                    "Rank candidates by return over lookback"
                }
            }
            NodeKind::Risk => "Assess budget and sizing constraints",
            NodeKind::Proposal => "Create order proposal",
            NodeKind::PolicyCheck => "Validate policy/risk/budget constraints",
            NodeKind::Approval => "Await user approval when required",
            NodeKind::Execution => {
                if execution_mode == "ASSISTED_LIVE" {
                    "Generate order ticket"
                } else {
                    "Place order via provider"
                }
            }
            NodeKind::PostTrade => "Fetch fills and update portfolio",
            NodeKind::Eval => "Run evaluations",
        }
    }

    /// The fixed node order for a run; `news` drops out when disabled.
    pub fn sequence(news_enabled: bool) -> Vec<NodeKind> {
        let mut nodes = vec![NodeKind::Research];
        if news_enabled {
            nodes.push(NodeKind::News);
        }
        nodes.extend([
            NodeKind::Signals,
            NodeKind::Risk,
            NodeKind::Proposal,
            NodeKind::PolicyCheck,
            NodeKind::Approval,
            NodeKind::Execution,
            NodeKind::PostTrade,
            NodeKind::Eval,
        ]);
        nodes
    }

    pub async fn execute(&self, deps: &Deps, ctx: &NodeCtx) -> Result<NodeOutput> {
        match self {
            NodeKind::Research => research::execute(deps, ctx).await,
            NodeKind::News => news::execute(deps, ctx).await,
            NodeKind::Signals => signals::execute(deps, ctx).await,
            NodeKind::Risk => risk::execute(deps, ctx).await,
            NodeKind::Proposal => proposal::execute(deps, ctx).await,
            NodeKind::PolicyCheck => policy_check::execute(deps, ctx).await,
            NodeKind::Approval => approval::execute(deps, ctx).await,
            NodeKind::Execution => execution::execute(deps, ctx).await,
            NodeKind::PostTrade => post_trade::execute(deps, ctx).await,
            NodeKind::Eval => eval::execute(deps, ctx).await,
        }
    }
}

/// Parse the run's stored `parsed_intent_json`, with permissive defaults
/// for trigger-created runs that carry no intent.
pub fn load_intent(run: &crate::db::runs::RunRow) -> crate::models::TradeIntent {
    run.parsed_intent_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| crate::models::TradeIntent {
            side: "BUY".to_string(),
            budget_usd: crate::intent::DEFAULT_BUDGET_USD,
            metric: "return".to_string(),
            window: "24h".to_string(),
            lookback_hours: 24,
            universe: crate::intent::DEFAULT_UNIVERSE.iter().map(|s| s.to_string()).collect(),
            raw_command: run.command_text.clone().unwrap_or_default(),
            constraints: serde_json::json!({}),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_order_fixed() {
        let names: Vec<&str> = NodeKind::sequence(true).iter().map(|n| n.name()).collect();
        assert_eq!(
            names,
            vec![
                "research",
                "news",
                "signals",
                "risk",
                "proposal",
                "policy_check",
                "approval",
                "execution",
                "post_trade",
                "eval"
            ]
        );
    }

    #[test]
    fn test_news_skipped_when_disabled() {
        let names: Vec<&str> = NodeKind::sequence(false).iter().map(|n| n.name()).collect();
        assert!(!names.contains(&"news"));
        assert_eq!(names.len(), 9);
    }
}
