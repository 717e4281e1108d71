//! Shared type definitions for the coordination orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::agent::AgentId;
use parkline_provider_core::CallRef;

/// Call identifier, owned by the coordination core
///
/// Distinct from [`CallRef`], which is the provider's identifier for the
/// same call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        CallId(format!("call-{}", Uuid::new_v4()))
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        CallId(s)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        CallId(s.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a parked-call record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParkedCallId(pub String);

impl ParkedCallId {
    pub fn new() -> Self {
        ParkedCallId(format!("parked-{}", Uuid::new_v4()))
    }
}

impl From<String> for ParkedCallId {
    fn from(s: String) -> Self {
        ParkedCallId(s)
    }
}

impl From<&str> for ParkedCallId {
    fn from(s: &str) -> Self {
        ParkedCallId(s.to_string())
    }
}

impl fmt::Display for ParkedCallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ParkedCallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Direction of a call relative to the agent pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "INBOUND",
            CallDirection::Outbound => "OUTBOUND",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INBOUND" => Some(CallDirection::Inbound),
            "OUTBOUND" => Some(CallDirection::Outbound),
            _ => None,
        }
    }
}

/// Call lifecycle status
///
/// Transitions are enforced by conditional writes, never by in-process
/// checks alone:
///
/// ```text
/// Ringing ──► Active ──► Parked ──► Transferring ──► Active
///    │           │          │             │
///    ▼           ▼          ▼             ▼
///  Missed    Completed  Abandoned     Completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// Offered simultaneously to all eligible agents
    Ringing,
    /// Connected to exactly one owning agent
    Active,
    /// Suspended in the provider's holding construct, unowned
    Parked,
    /// Being redirected to a transfer target
    Transferring,
    /// Ended normally
    Completed,
    /// Nobody claimed it before the ring resolved
    Missed,
    /// The caller gave up while parked, or the park aged out
    Abandoned,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "RINGING",
            CallStatus::Active => "ACTIVE",
            CallStatus::Parked => "PARKED",
            CallStatus::Transferring => "TRANSFERRING",
            CallStatus::Completed => "COMPLETED",
            CallStatus::Missed => "MISSED",
            CallStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RINGING" => Some(CallStatus::Ringing),
            "ACTIVE" => Some(CallStatus::Active),
            "PARKED" => Some(CallStatus::Parked),
            "TRANSFERRING" => Some(CallStatus::Transferring),
            "COMPLETED" => Some(CallStatus::Completed),
            "MISSED" => Some(CallStatus::Missed),
            "ABANDONED" => Some(CallStatus::Abandoned),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Missed | CallStatus::Abandoned
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_lowercase())
    }
}

/// Snapshot of one coordinated call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    /// Coordination-core identifier
    pub call_id: CallId,

    /// Provider-side reference for the same call
    pub provider_ref: CallRef,

    /// Inbound or outbound
    pub direction: CallDirection,

    /// Current lifecycle status
    pub status: CallStatus,

    /// Originating address
    pub from_address: String,

    /// Dialed address
    pub to_address: String,

    /// Owning agent, if any; parked calls are unowned
    pub owner: Option<AgentId>,

    /// Pending transfer target recorded by unpark, if any
    pub transfer_target: Option<AgentId>,

    /// When the call entered the system
    pub created_at: DateTime<Utc>,

    /// When ownership was first established
    pub answered_at: Option<DateTime<Utc>>,

    /// When the call reached a terminal status
    pub ended_at: Option<DateTime<Utc>>,
}

/// Outcome of a claim attempt
///
/// A lost race is an outcome, not an error: the ledger simply reports that
/// some other agent owns the call now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    /// Whether this agent now owns the call
    pub won: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_status_round_trips() {
        for status in [
            CallStatus::Ringing,
            CallStatus::Active,
            CallStatus::Parked,
            CallStatus::Transferring,
            CallStatus::Completed,
            CallStatus::Missed,
            CallStatus::Abandoned,
        ] {
            assert_eq!(CallStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(CallStatus::Completed.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Abandoned.is_terminal());
        assert!(!CallStatus::Parked.is_terminal());
        assert!(!CallStatus::Transferring.is_terminal());
    }
}
