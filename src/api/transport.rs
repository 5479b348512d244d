//! Network leg of the request pipeline

use async_trait::async_trait;
use url::Url;

use super::request::{ApiError, ApiRequest, ApiResponse};

/// Sends one request and delivers its response.
///
/// Any non-2xx status comes back as [`ApiError::Status`] so the interceptor
/// can recognise a 401 without looking at bodies.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError>;
}

/// reqwest-backed transport rooted at the API base URL.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = endpoint_url(&self.base_url, &request.path).map_err(|e| ApiError::Transport {
            path: request.path.clone(),
            message: e.to_string(),
        })?;
        tracing::debug!("{} {}", request.method, url);

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(request.headers.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| ApiError::Transport {
            path: request.path.clone(),
            message: e.to_string(),
        })?;

        check_response(resp, &request.path).await
    }
}

/// Append `path` to `base`, keeping any path prefix the base already has.
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

/// Turn a non-2xx status into an error carrying the body.
async fn check_response(resp: reqwest::Response, path: &str) -> Result<ApiResponse, ApiError> {
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.bytes().await.map_err(|e| ApiError::Transport {
        path: path.to_string(),
        message: format!("failed to read body: {}", e),
    })?;

    if !status.is_success() {
        return Err(ApiError::Status {
            status,
            path: path.to_string(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    Ok(ApiResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}
