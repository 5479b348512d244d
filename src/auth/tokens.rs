//! Token storage and management

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::TokenGrant;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const EXPIRES_AT_KEY: &str = "tokenExpiresAt";

/// Persistent key-value capability backing the token store.
///
/// Implementations are expected to survive process restarts where that makes
/// sense (see [`super::storage::FileStore`]). Persistence failures are the
/// backend's problem: callers never see them.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Handle to the current session tokens.
///
/// Cloning is cheap and every clone sees the same backend, so nobody needs
/// to hold a private copy of a token across an await point.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    /// `None` erases the stored access token.
    pub fn set_access_token(&self, token: Option<String>) {
        self.write(ACCESS_TOKEN_KEY, token);
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    /// `None` erases the stored refresh token.
    pub fn set_refresh_token(&self, token: Option<String>) {
        self.write(REFRESH_TOKEN_KEY, token);
    }

    /// When the access token was reported to expire, if known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.read(EXPIRES_AT_KEY)?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!("Ignoring malformed token expiry {:?}: {}", raw, e);
                None
            }
        }
    }

    pub fn set_expires_at(&self, at: Option<DateTime<Utc>>) {
        self.write(EXPIRES_AT_KEY, at.map(|ts| ts.to_rfc3339()));
    }

    /// Persist a freshly issued grant.
    pub fn store(&self, grant: &TokenGrant) {
        self.set_access_token(Some(grant.access_token.clone()));
        self.set_refresh_token(Some(grant.refresh_token.clone()));
        self.set_expires_at(
            grant
                .expires_in
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(Duration::try_seconds)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl)),
        );
    }

    /// A session is only usable when both tokens are present.
    pub fn has_session(&self) -> bool {
        self.access_token().is_some() && self.refresh_token().is_some()
    }

    /// Erase every session key. Safe to call on an empty store.
    pub fn clear(&self) {
        self.backend.remove(ACCESS_TOKEN_KEY);
        self.backend.remove(REFRESH_TOKEN_KEY);
        self.backend.remove(EXPIRES_AT_KEY);
    }

    fn read(&self, key: &str) -> Option<String> {
        self.backend.get(key).filter(|v| !v.is_empty())
    }

    fn write(&self, key: &str, value: Option<String>) {
        match value {
            Some(v) if !v.is_empty() => self.backend.set(key, &v),
            _ => self.backend.remove(key),
        }
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secrets themselves
        f.debug_struct("TokenStore")
            .field("access_token", &self.access_token().is_some())
            .field("refresh_token", &self.refresh_token().is_some())
            .finish()
    }
}
