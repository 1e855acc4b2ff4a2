use agora_models::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// The slice of a platform user this core cares about.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: UserId,
    pub is_active: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn active(id: UserId) -> Self {
        Self {
            id,
            is_active: true,
            last_login: None,
            last_seen: None,
        }
    }
}

/// Seam to the platform's user service. Authentication consults the
/// active flag (token revocation); presence pushes last-seen/last-login
/// stamps back through it. No other persistence is owned here.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Option<UserProfile>;
    async fn record_last_login(&self, id: UserId, at: DateTime<Utc>);
    async fn record_last_seen(&self, id: UserId, at: DateTime<Utc>);
}

/// In-memory store for tests and local runs.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<UserId, UserProfile>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: UserProfile) {
        self.users.insert(profile.id, profile);
    }

    pub fn deactivate(&self, id: UserId) {
        if let Some(mut user) = self.users.get_mut(&id) {
            user.is_active = false;
        }
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, id: UserId) -> Option<UserProfile> {
        self.users.get(&id).map(|u| u.clone())
    }

    async fn record_last_login(&self, id: UserId, at: DateTime<Utc>) {
        if let Some(mut user) = self.users.get_mut(&id) {
            user.last_login = Some(at);
        }
    }

    async fn record_last_seen(&self, id: UserId, at: DateTime<Utc>) {
        if let Some(mut user) = self.users.get_mut(&id) {
            user.last_seen = Some(at);
        }
    }
}
