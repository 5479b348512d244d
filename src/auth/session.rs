//! HarajPlus authentication endpoints

use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use super::{AuthError, AuthService, TokenGrant, TokenStore};
use crate::api::transport::endpoint_url;
use crate::models::{Credentials, NewAccount, UserProfile};

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const REFRESH_PATH: &str = "/auth/refresh-token";
const LOGOUT_PATH: &str = "/auth/logout";

/// Session owner backed by the HarajPlus REST API.
///
/// Talks to the auth endpoints directly rather than through the
/// interceptor, so a failing refresh or logout can never recurse into
/// another refresh.
pub struct HttpAuthService {
    http: reqwest::Client,
    base_url: Url,
    tokens: TokenStore,
    profile: Mutex<Option<UserProfile>>,
}

impl HttpAuthService {
    pub fn new(http: reqwest::Client, base_url: Url, tokens: TokenStore) -> Self {
        Self {
            http,
            base_url,
            tokens,
            profile: Mutex::new(None),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Email/password login. Stores the issued tokens.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenGrant, AuthError> {
        tracing::info!("Logging in as {}", email);
        let grant: TokenGrant = self
            .post_json(LOGIN_PATH, &Credentials { email, password }, None)
            .await?;
        self.start_session(&grant);
        Ok(grant)
    }

    /// Create an account. The backend signs the new user in immediately.
    pub async fn register(&self, account: &NewAccount) -> Result<TokenGrant, AuthError> {
        tracing::info!("Registering {}", account.email);
        let grant: TokenGrant = self.post_json(REGISTER_PATH, account, None).await?;
        self.start_session(&grant);
        Ok(grant)
    }

    /// Sign in with an identity token from an external provider
    /// (`google`, `apple`, ...).
    pub async fn social_login(
        &self,
        provider: &str,
        id_token: &str,
    ) -> Result<TokenGrant, AuthError> {
        tracing::info!("Logging in with {}", provider);
        let path = format!("/auth/social/{}", provider);
        let grant: TokenGrant = self
            .post_json(&path, &serde_json::json!({ "token": id_token }), None)
            .await?;
        self.start_session(&grant);
        Ok(grant)
    }

    /// Drop every piece of local session state. Safe to call repeatedly.
    pub fn clear_session(&self) {
        self.tokens.clear();
        *self.profile.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn cache_profile(&self, profile: UserProfile) {
        *self.profile.lock().unwrap_or_else(|e| e.into_inner()) = Some(profile);
    }

    pub fn cached_profile(&self) -> Option<UserProfile> {
        self.profile
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn start_session(&self, grant: &TokenGrant) {
        // A different user may have been signed in before
        self.clear_session();
        self.tokens.store(grant);
    }

    async fn post_json<B, T>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.post(path, body, bearer).await?;
        resp.json().await.map_err(|e| AuthError::InvalidResponse {
            endpoint: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn post<B>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, AuthError>
    where
        B: Serialize + ?Sized,
    {
        let url = endpoint_url(&self.base_url, path).map_err(|e| AuthError::Transport {
            endpoint: path.to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!("POST {}", url);

        let mut request = self.http.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| AuthError::Transport {
            endpoint: path.to_string(),
            message: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                endpoint: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        self.post_json(
            REFRESH_PATH,
            &serde_json::json!({ "refreshToken": refresh_token }),
            None,
        )
        .await
    }

    async fn logout(&self) {
        let access = self.tokens.access_token();
        let refresh = self.tokens.refresh_token();
        self.clear_session();

        let Some(access) = access else {
            tracing::debug!("No access token, skipping server logout");
            return;
        };

        let body = serde_json::json!({ "refreshToken": refresh });
        match self.post(LOGOUT_PATH, &body, Some(access.as_str())).await {
            Ok(_) => tracing::debug!("Server session revoked"),
            Err(e) => tracing::warn!("Server logout failed (local session cleared): {}", e),
        }
    }
}
