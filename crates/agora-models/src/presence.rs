use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::UserId;

/// Live presence state for one user. One record per user id, not per
/// connection; retained as last-known state after the user goes offline.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub show_online_status: bool,
    pub show_last_seen: bool,
    /// Number of open connections owned by this user. Online iff > 0.
    #[serde(skip)]
    pub connections: usize,
}

impl PresenceRecord {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            online: false,
            last_seen: None,
            show_online_status: true,
            show_last_seen: true,
            connections: 0,
        }
    }
}

/// Outward `presence-update` payload, filtered by the user's visibility
/// preferences before it ever leaves the presence tracker.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}
