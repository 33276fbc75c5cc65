//! Run, confirmation, and node lifecycles with validated transitions.
//!
//! All status writes must go through these guards; terminal states are
//! sinks and re-entry attempts are treated as idempotent no-ops by the
//! callers.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "CREATED",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(RunStatus::Created),
            "RUNNING" => Some(RunStatus::Running),
            "PAUSED" => Some(RunStatus::Paused),
            "COMPLETED" => Some(RunStatus::Completed),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "CONFIRMED")]
    Confirmed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Pending => "PENDING",
            ConfirmationStatus::Confirmed => "CONFIRMED",
            ConfirmationStatus::Cancelled => "CANCELLED",
            ConfirmationStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ConfirmationStatus::Pending),
            "CONFIRMED" => Some(ConfirmationStatus::Confirmed),
            "CANCELLED" => Some(ConfirmationStatus::Cancelled),
            "EXPIRED" => Some(ConfirmationStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConfirmationStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Completed => "COMPLETED",
            NodeStatus::Failed => "FAILED",
        }
    }
}

/// Check whether a run may move from `current` to `next`.
pub fn can_transition(current: RunStatus, next: RunStatus) -> bool {
    use RunStatus::*;
    match current {
        Created => matches!(next, Running | Failed),
        Running => matches!(next, Paused | Completed | Failed),
        Paused => matches!(next, Running | Failed),
        Completed | Failed => false,
    }
}

/// Check whether a confirmation may move from `current` to `next`.
pub fn can_transition_confirmation(
    current: ConfirmationStatus,
    next: ConfirmationStatus,
) -> bool {
    use ConfirmationStatus::*;
    match current {
        Pending => matches!(next, Confirmed | Cancelled | Expired),
        Confirmed | Cancelled | Expired => false,
    }
}

/// Check whether a node may move from `current` to `next`.
pub fn can_transition_node(current: NodeStatus, next: NodeStatus) -> bool {
    use NodeStatus::*;
    match current {
        Pending => matches!(next, Running),
        Running => matches!(next, Completed | Failed),
        Completed | Failed => false,
    }
}

#[derive(Debug)]
pub struct InvalidTransition {
    pub entity_id: String,
    pub current: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition for {}: {} -> {}",
            self.entity_id, self.current, self.attempted
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_transitions() {
        use RunStatus::*;
        assert!(can_transition(Created, Running));
        assert!(can_transition(Created, Failed));
        assert!(!can_transition(Created, Completed));
        assert!(can_transition(Running, Paused));
        assert!(can_transition(Running, Completed));
        assert!(can_transition(Paused, Running));
        assert!(can_transition(Paused, Failed));
        assert!(!can_transition(Paused, Completed));
    }

    #[test]
    fn test_terminal_runs_are_sinks() {
        use RunStatus::*;
        for next in [Created, Running, Paused, Completed, Failed] {
            assert!(!can_transition(Completed, next));
            assert!(!can_transition(Failed, next));
        }
    }

    #[test]
    fn test_confirmation_single_use() {
        use ConfirmationStatus::*;
        assert!(can_transition_confirmation(Pending, Confirmed));
        assert!(can_transition_confirmation(Pending, Cancelled));
        assert!(can_transition_confirmation(Pending, Expired));
        for next in [Pending, Confirmed, Cancelled, Expired] {
            assert!(!can_transition_confirmation(Confirmed, next));
            assert!(!can_transition_confirmation(Cancelled, next));
            assert!(!can_transition_confirmation(Expired, next));
        }
    }

    #[test]
    fn test_node_linear_lifecycle() {
        use NodeStatus::*;
        assert!(can_transition_node(Pending, Running));
        assert!(can_transition_node(Running, Completed));
        assert!(can_transition_node(Running, Failed));
        assert!(!can_transition_node(Completed, Running));
        assert!(!can_transition_node(Pending, Completed));
    }
}
