use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Unique identifier for one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Call lifecycle states. Transitions are monotonic: once a terminal
/// state is reached the call never changes state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Ringing,
    Accepted,
    Declined,
    TimedOut,
    Ended,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Declined | CallState::TimedOut | CallState::Ended)
    }

    /// Whether signaling messages may still be relayed for a call in this
    /// state.
    pub fn accepts_signaling(&self) -> bool {
        matches!(self, CallState::Ringing | CallState::Accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Hangup,
    Declined,
    Timeout,
    PeerDisconnected,
}

/// Snapshot of one call session as reported to callers of the call
/// manager. The live record (including its timeout task) stays internal.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub caller: UserId,
    pub targets: Vec<UserId>,
    pub media: MediaKind,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

impl CallInfo {
    /// All user ids participating in this call, caller first.
    pub fn participants(&self) -> impl Iterator<Item = UserId> + '_ {
        std::iter::once(self.caller).chain(self.targets.iter().copied())
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participants().any(|p| p == user_id)
    }

    /// Participants other than `user_id` (the relay fan-out set).
    pub fn counterparts(&self, user_id: UserId) -> Vec<UserId> {
        self.participants().filter(|&p| p != user_id).collect()
    }
}
