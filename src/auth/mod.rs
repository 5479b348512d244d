//! Authentication module for the HarajPlus API
//!
//! Owns the session tokens and the calls that create, renew and destroy
//! them. The request pipeline in [`crate::api`] only sees the
//! [`AuthService`] trait.

pub mod flow;
pub mod session;
pub mod storage;
pub mod tokens;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use flow::{login, logout, register, status, LoginMethod};
pub use session::HttpAuthService;
pub use tokens::{KeyValueStore, TokenStore};

/// Tokens issued by login, registration or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Failures of the authentication endpoints.
///
/// `Clone` so a single refresh failure can be delivered to every request
/// that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("{endpoint} rejected the request (HTTP {status}): {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("unexpected response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("token refresh timed out after {0:?}")]
    Timeout(Duration),
}

/// What the request pipeline needs from the authentication backend.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Exchange a refresh token for a new grant. Must not touch the token
    /// store; the caller decides what to persist.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;

    /// Clear the local session unconditionally, then notify the server on a
    /// best-effort basis.
    async fn logout(&self);
}
