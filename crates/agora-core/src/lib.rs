pub mod auth;
pub mod calls;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod users;

use std::sync::Arc;
use std::time::Duration;

use auth::{AuthPolicy, SessionAuthenticator};
use calls::CallManager;
use gateway::BroadcastGateway;
use presence::PresenceTracker;
use registry::ConnectionRegistry;
use relay::SignalingRelay;
use rooms::RoomManager;
use users::UserStore;

/// Policy values for the realtime core. All timer durations are
/// deployment policy, not code constants.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub jwt_secret: String,
    pub auth_policy: AuthPolicy,
    /// How long an unanswered call rings before it is marked missed.
    pub ring_timeout: Duration,
    /// Grace period before a disconnect is committed as offline.
    pub offline_grace: Duration,
    /// How long terminal calls are retained for late-signaling rejection.
    pub call_retention: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            auth_policy: AuthPolicy::Strict,
            ring_timeout: Duration::from_secs(30),
            offline_grace: Duration::from_secs(5),
            call_retention: Duration::from_secs(60),
        }
    }
}

/// Shared handles for every connection handler and for external
/// collaborators. Cheap to clone; all components are internally
/// synchronized, so no outer lock wraps them.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomManager>,
    pub presence: Arc<PresenceTracker>,
    pub calls: Arc<CallManager>,
    pub relay: Arc<SignalingRelay>,
    pub gateway: BroadcastGateway,
    pub auth: Arc<SessionAuthenticator>,
    pub users: Arc<dyn UserStore>,
}

impl AppState {
    pub fn new(config: CoreConfig, users: Arc<dyn UserStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let presence = Arc::new(PresenceTracker::new(
            rooms.clone(),
            users.clone(),
            config.offline_grace,
        ));
        let calls = Arc::new(CallManager::new(
            rooms.clone(),
            registry.clone(),
            config.ring_timeout,
            config.call_retention,
        ));
        let relay = Arc::new(SignalingRelay::new(
            calls.clone(),
            registry.clone(),
            rooms.clone(),
        ));
        let gateway = BroadcastGateway::new(rooms.clone());
        let auth = Arc::new(SessionAuthenticator::new(
            config.jwt_secret.clone(),
            config.auth_policy,
            users.clone(),
        ));
        Self {
            registry,
            rooms,
            presence,
            calls,
            relay,
            gateway,
            auth,
            users,
        }
    }
}
