//! Login and bearer-token sessions for the bridge HTTP API.
//!
//! A single username/password pair (see [`Credentials`]) is read from a YAML
//! file. A successful [`SessionStore::login`] issues an opaque 256-bit token
//! that stays valid for the configured TTL or until [`SessionStore::logout`].

mod credentials;
mod store;

pub use credentials::{timing_safe_eq, Credentials, CredentialsError};
pub use store::{AuthError, Session, SessionStore, DEFAULT_TTL};

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
