//! Core types shared between the coordination layer and provider adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-side reference for a call
///
/// This is the identifier the provider assigned to the call and the only
/// handle the coordination layer may use when talking back to the provider.
/// It is opaque here; SIP-backed providers typically put a Call-ID in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallRef(pub String);

impl From<String> for CallRef {
    fn from(s: String) -> Self {
        CallRef(s)
    }
}

impl From<&str> for CallRef {
    fn from(s: &str) -> Self {
        CallRef(s.to_string())
    }
}

impl fmt::Display for CallRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CallRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Call status as reported by the provider's asynchronous callback stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderCallStatus {
    /// The call is being offered and has not connected yet
    Ringing,
    /// A leg of the call is connected and carrying media
    InProgress,
    /// The call ended normally
    Completed,
    /// The destination was busy
    Busy,
    /// The destination never answered
    NoAnswer,
    /// The call failed on the provider side
    Failed,
}

impl ProviderCallStatus {
    /// Terminal statuses end the call; no further status will follow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Busy | Self::NoAnswer | Self::Failed
        )
    }
}

impl fmt::Display for ProviderCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ringing => "ringing",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Busy => "busy",
            Self::NoAnswer => "no-answer",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ProviderCallStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(Self::Ringing),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "busy" => Ok(Self::Busy),
            "no-answer" => Ok(Self::NoAnswer),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown provider call status: {}", s)),
        }
    }
}

/// One entry in the provider's asynchronous status stream
///
/// Status events are delivered to the coordination engine in provider
/// order per call, but may race agent actions arbitrarily; the engine is
/// responsible for treating terminal statuses as authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatusEvent {
    /// Which call the status belongs to
    pub call: CallRef,

    /// The reported status
    pub status: ProviderCallStatus,

    /// When the provider reported it
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ProviderCallStatus::Completed.is_terminal());
        assert!(ProviderCallStatus::Failed.is_terminal());
        assert!(ProviderCallStatus::Busy.is_terminal());
        assert!(ProviderCallStatus::NoAnswer.is_terminal());
        assert!(!ProviderCallStatus::Ringing.is_terminal());
        assert!(!ProviderCallStatus::InProgress.is_terminal());
    }

    #[test]
    fn status_round_trips_through_display() {
        for status in [
            ProviderCallStatus::Ringing,
            ProviderCallStatus::InProgress,
            ProviderCallStatus::Completed,
            ProviderCallStatus::Busy,
            ProviderCallStatus::NoAnswer,
            ProviderCallStatus::Failed,
        ] {
            let parsed: ProviderCallStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
