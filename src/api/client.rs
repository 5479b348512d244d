//! Authenticated HTTP client for the HarajPlus API
//!
//! Wraps reqwest::Client with automatic token injection and refresh.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use super::interceptor::AuthInterceptor;
use super::request::{ApiError, ApiRequest, ApiResponse};
use super::transport::HttpTransport;
use crate::auth::storage::{FileStore, MemoryStore};
use crate::auth::{HttpAuthService, TokenStore};
use crate::config::Config;
use crate::models::UserProfile;

/// How the CLI wants the client built.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Overrides `api_base_url` from the config file
    pub api_url: Option<String>,
    /// Keep tokens in memory only
    pub ephemeral: bool,
}

/// Every call goes through the [`AuthInterceptor`].
pub struct HarajClient {
    config: Config,
    auth: Arc<HttpAuthService>,
    interceptor: AuthInterceptor,
    transport: HttpTransport,
}

impl HarajClient {
    /// Load config and credentials from disk and build the client.
    pub fn connect(options: &ClientOptions) -> Result<Self> {
        let mut config = Config::load()?;
        if let Some(url) = &options.api_url {
            config.api_base_url = url.clone();
        }

        let tokens = if options.ephemeral {
            TokenStore::new(Arc::new(MemoryStore::default()))
        } else {
            let path = Config::credentials_path()?;
            tracing::debug!("Using credentials at {}", path.display());
            TokenStore::new(Arc::new(FileStore::open(path)))
        };

        Self::new(config, tokens)
    }

    pub fn new(config: Config, tokens: TokenStore) -> Result<Self> {
        let base_url = config.base_url()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("harajplus-cli/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let auth = Arc::new(HttpAuthService::new(
            http.clone(),
            base_url.clone(),
            tokens.clone(),
        ));
        let interceptor = AuthInterceptor::new(tokens, auth.clone(), config.refresh_timeout());
        let transport = HttpTransport::new(http, base_url);

        Ok(Self {
            config,
            auth,
            interceptor,
            transport,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn auth(&self) -> &HttpAuthService {
        &self.auth
    }

    pub fn tokens(&self) -> &TokenStore {
        self.interceptor.tokens()
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.interceptor.handle(request, &self.transport).await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.get(path).await?.json()
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::post(path).with_json(body)).await
    }

    pub async fn put(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::put(path).with_json(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::delete(path)).await
    }

    /// Current user's profile. Cached on the auth service until logout.
    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        if let Some(profile) = self.auth.cached_profile() {
            return Ok(profile);
        }
        let profile: UserProfile = self.get_json("/users/me").await?;
        self.auth.cache_profile(profile.clone());
        Ok(profile)
    }
}
