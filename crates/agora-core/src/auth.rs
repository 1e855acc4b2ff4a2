use std::sync::Arc;

use agora_models::{Identity, UserId};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::users::UserStore;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error("user {0} is inactive")]
    UserInactive(UserId),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub iat: usize,
    pub exp: usize,
}

/// How connection-time authentication failures are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthPolicy {
    /// Hardened deployments: a bad token or inactive user rejects the
    /// connection.
    #[default]
    Strict,
    /// Development deployments: failures degrade to an anonymous
    /// connection instead of hard-failing. The degrade is always logged
    /// loudly so auth bugs cannot hide behind it.
    Relaxed,
}

pub fn create_token(user_id: UserId, secret: &str, expiry_secs: u64) -> Option<String> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: user_id,
        iat: now,
        exp: now + expiry_secs as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .ok()
}

/// Verifies the signature only. Expiry is deliberately not enforced:
/// sessions may outlive short-lived tokens, and revocation is handled by
/// the user store's active flag instead.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::default();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AuthError::InvalidToken)
}

/// Picks the bearer token from the connection-time sources in precedence
/// order: explicit auth payload, query parameter, header. An optional
/// `Bearer ` prefix is stripped from whichever source wins.
pub fn extract_token<'a>(
    auth_payload: Option<&'a str>,
    query_param: Option<&'a str>,
    header: Option<&'a str>,
) -> Option<&'a str> {
    auth_payload
        .or(query_param)
        .or(header)
        .map(|raw| raw.strip_prefix("Bearer ").unwrap_or(raw))
        .filter(|t| !t.is_empty())
}

pub struct SessionAuthenticator {
    secret: String,
    policy: AuthPolicy,
    users: Arc<dyn UserStore>,
}

impl SessionAuthenticator {
    pub fn new(secret: impl Into<String>, policy: AuthPolicy, users: Arc<dyn UserStore>) -> Self {
        Self {
            secret: secret.into(),
            policy,
            users,
        }
    }

    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    /// Strict resolution: no token admits as anonymous; a presented token
    /// must verify and resolve to an active user.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let Some(token) = token else {
            return Ok(Identity::Anonymous);
        };
        let claims = validate_token(token, &self.secret)?;
        let user = self
            .users
            .find_by_id(claims.sub)
            .await
            .ok_or(AuthError::UnknownUser(claims.sub))?;
        if !user.is_active {
            return Err(AuthError::UserInactive(user.id));
        }
        self.users
            .record_last_login(user.id, chrono::Utc::now())
            .await;
        Ok(Identity::User(user.id))
    }

    /// Policy-aware admission used at the connection boundary. Under
    /// `Relaxed`, failures degrade to anonymous with a warning instead of
    /// rejecting the connection.
    pub async fn admit(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match self.authenticate(token).await {
            Ok(identity) => Ok(identity),
            Err(err) => match self.policy {
                AuthPolicy::Strict => Err(err),
                AuthPolicy::Relaxed => {
                    tracing::warn!(
                        error = %err,
                        "authentication failed; admitting as anonymous (relaxed auth policy)"
                    );
                    Ok(Identity::Anonymous)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::{InMemoryUserStore, UserProfile};

    const SECRET: &str = "test-secret";

    fn authenticator(policy: AuthPolicy) -> (SessionAuthenticator, Arc<InMemoryUserStore>) {
        let store = Arc::new(InMemoryUserStore::new());
        store.insert(UserProfile::active(7));
        (
            SessionAuthenticator::new(SECRET, policy, store.clone()),
            store,
        )
    }

    #[test]
    fn token_precedence_and_bearer_strip() {
        assert_eq!(extract_token(Some("a"), Some("b"), Some("c")), Some("a"));
        assert_eq!(extract_token(None, Some("b"), Some("c")), Some("b"));
        assert_eq!(extract_token(None, None, Some("Bearer c")), Some("c"));
        assert_eq!(extract_token(None, None, None), None);
        assert_eq!(extract_token(None, None, Some("")), None);
    }

    #[tokio::test]
    async fn valid_token_resolves_user_and_stamps_last_login() {
        let (auth, store) = authenticator(AuthPolicy::Strict);
        let token = create_token(7, SECRET, 3600).unwrap();
        let identity = auth.authenticate(Some(&token)).await.unwrap();
        assert_eq!(identity, Identity::User(7));
        assert!(store.find_by_id(7).await.unwrap().last_login.is_some());
    }

    #[tokio::test]
    async fn expired_token_is_still_accepted() {
        let (auth, _) = authenticator(AuthPolicy::Strict);
        // Expired an hour ago; only the signature matters here.
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: 7,
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(
            auth.authenticate(Some(&token)).await.unwrap(),
            Identity::User(7)
        );
    }

    #[tokio::test]
    async fn no_token_admits_anonymous() {
        let (auth, _) = authenticator(AuthPolicy::Strict);
        assert_eq!(auth.admit(None).await.unwrap(), Identity::Anonymous);
    }

    #[tokio::test]
    async fn bad_token_rejected_under_strict() {
        let (auth, _) = authenticator(AuthPolicy::Strict);
        assert!(matches!(
            auth.admit(Some("garbage")).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn bad_token_degrades_under_relaxed() {
        let (auth, _) = authenticator(AuthPolicy::Relaxed);
        assert_eq!(
            auth.admit(Some("garbage")).await.unwrap(),
            Identity::Anonymous
        );
    }

    #[tokio::test]
    async fn inactive_user_rejected_under_strict() {
        let (auth, store) = authenticator(AuthPolicy::Strict);
        store.deactivate(7);
        let token = create_token(7, SECRET, 3600).unwrap();
        assert!(matches!(
            auth.admit(Some(&token)).await,
            Err(AuthError::UserInactive(7))
        ));
    }

    #[tokio::test]
    async fn wrong_secret_fails_verification() {
        let (auth, _) = authenticator(AuthPolicy::Strict);
        let token = create_token(7, "other-secret", 3600).unwrap();
        assert!(matches!(
            auth.authenticate(Some(&token)).await,
            Err(AuthError::InvalidToken)
        ));
    }
}
