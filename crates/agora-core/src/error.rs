use agora_models::call::CallId;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The call left `Ringing` before this request reached it: already
    /// accepted on another device, declined, timed out, or unknown.
    #[error("call {0} is no longer available")]
    StaleCall(CallId),
    /// Relay (or call action) from a connection that is not a legitimate
    /// participant of the call, or the call is past its signaling window.
    #[error("invalid relay target for call {0}")]
    InvalidRelayTarget(CallId),
}
