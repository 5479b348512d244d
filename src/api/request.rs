//! Request/response descriptors passed through the interceptor

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::auth::AuthError;

/// An outgoing API call, relative to the configured base URL.
///
/// Cheap enough to clone that the interceptor keeps the caller's original
/// around for replays instead of mutating it.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Copy of this request carrying `Authorization: Bearer <token>`.
    ///
    /// Any existing authorization header is replaced. A token that is not a
    /// valid header value is skipped with a warning rather than sent mangled.
    pub fn with_bearer(&self, token: &str) -> Self {
        let mut out = self.clone();
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                out.headers.insert(AUTHORIZATION, value);
            }
            Err(e) => {
                tracing::warn!("Access token is not a valid header value: {}", e);
            }
        }
        out
    }

    /// Token carried in the bearer header, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Everything that can go wrong on the way to a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {} for {path}: {body}", .status.as_u16())]
    Status {
        status: StatusCode,
        path: String,
        body: String,
    },

    /// The request never produced a response.
    #[error("request to {path} failed: {message}")]
    Transport { path: String, message: String },

    /// The session expired and there is no refresh token to renew it.
    #[error("Unauthorized: session expired, log in again")]
    Unauthorized,

    /// The session expired and renewing it failed.
    #[error("token refresh failed: {0}")]
    Refresh(#[from] AuthError),

    /// The request that owned the in-flight refresh went away before it
    /// settled.
    #[error("token refresh was cancelled")]
    RefreshCancelled,

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True only for a 401 answered by the server.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// True when the caller has to sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::Refresh(_)) || self.is_unauthorized()
    }
}
