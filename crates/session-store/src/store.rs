use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::credentials::Credentials;

/// Default session lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Random bytes per token; rendered as twice as many hex characters.
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("missing token")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,
}

/// A freshly issued session, as returned to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// In-memory bearer token registry.
///
/// Tokens are checked lazily: an expired token is only removed when someone
/// tries to use it.
pub struct SessionStore {
    credentials: Credentials,
    ttl: Duration,
    /// Token to expiry; `None` when the TTL runs past what `Instant` can hold.
    sessions: Mutex<HashMap<String, Option<Instant>>>,
}

impl SessionStore {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_ttl(credentials, DEFAULT_TTL)
    }

    pub fn with_ttl(credentials: Credentials, ttl: Duration) -> Self {
        Self {
            credentials,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Option<Instant>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check credentials and issue a new token on success.
    pub fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        if !self.credentials.verify(username, password) {
            warn!(%username, "login rejected");
            return Err(AuthError::InvalidCredentials);
        }

        let token = generate_token();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sessions()
            .insert(token.clone(), Instant::now().checked_add(self.ttl));

        info!(%username, "session issued");
        Ok(Session { token, expires_at })
    }

    /// Whether `token` names a live session. Expired sessions are evicted.
    pub fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let mut sessions = self.sessions();
        match sessions.get(token) {
            Some(None) => true,
            Some(Some(expiry)) if Instant::now() < *expiry => true,
            Some(_) => {
                sessions.remove(token);
                debug!("expired session evicted");
                false
            }
            None => false,
        }
    }

    /// Like [`validate`](Self::validate) but with a reason on failure.
    pub fn authorize(&self, token: Option<&str>) -> Result<(), AuthError> {
        match token {
            None | Some("") => Err(AuthError::MissingToken),
            Some(token) if self.validate(token) => Ok(()),
            Some(_) => Err(AuthError::InvalidToken),
        }
    }

    /// Remove `token`. Returns whether it was present.
    pub fn logout(&self, token: &str) -> bool {
        self.sessions().remove(token).is_some()
    }

    /// Sessions currently stored, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .field("sessions", &self.len())
            .finish()
    }
}

fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Credentials::default())
    }

    #[tokio::test(start_paused = true)]
    async fn login_issues_a_valid_token() {
        let store = store();
        let session = store.login("admin", "admin123").unwrap();

        assert_eq!(session.token.len(), 64);
        assert!(session.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(session.expires_at > Utc::now());
        assert!(store.validate(&session.token));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_credentials_issue_nothing() {
        let store = store();
        assert_eq!(
            store.login("admin", "wrong").unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_are_unique() {
        let store = store();
        let a = store.login("admin", "admin123").unwrap();
        let b = store.login("admin", "admin123").unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_rejected_and_evicted() {
        let store = SessionStore::with_ttl(Credentials::default(), Duration::from_secs(60));
        let session = store.login("admin", "admin123").unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.validate(&session.token));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.len(), 1);
        assert!(!store.validate(&session.token));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_ttl_is_one_day() {
        let store = store();
        let session = store.login("admin", "admin123").unwrap();

        tokio::time::advance(DEFAULT_TTL - Duration::from_secs(1)).await;
        assert!(store.validate(&session.token));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.validate(&session.token));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_ttl_never_expires() {
        let store = SessionStore::with_ttl(Credentials::default(), Duration::MAX);
        let session = store.login("admin", "admin123").unwrap();

        assert_eq!(session.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(store.validate(&session.token));
        tokio::time::advance(Duration::from_secs(10 * 365 * 24 * 60 * 60)).await;
        assert!(store.validate(&session.token));
        assert!(store.logout(&session.token));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_invalidates_immediately() {
        let store = store();
        let session = store.login("admin", "admin123").unwrap();

        assert!(store.logout(&session.token));
        assert!(!store.validate(&session.token));
        assert!(!store.logout(&session.token));
    }

    #[tokio::test(start_paused = true)]
    async fn authorize_distinguishes_missing_from_invalid() {
        let store = store();
        let session = store.login("admin", "admin123").unwrap();

        assert_eq!(store.authorize(None), Err(AuthError::MissingToken));
        assert_eq!(store.authorize(Some("")), Err(AuthError::MissingToken));
        assert_eq!(store.authorize(Some("nope")), Err(AuthError::InvalidToken));
        assert_eq!(store.authorize(Some(&session.token)), Ok(()));
    }

    #[test]
    fn session_serializes_in_camel_case() {
        let session = Session {
            token: "abc".into(),
            expires_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["token"], "abc");
        assert_eq!(value["expiresAt"], "1970-01-01T00:00:00Z");
    }
}
