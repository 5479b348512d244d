//! API client module for HarajPlus
//!
//! Every request goes through [`interceptor::AuthInterceptor`], which adds the
//! bearer token and transparently renews an expired session.

pub mod client;
pub mod interceptor;
mod me;
pub mod refresh;
pub mod request;
pub mod transport;

use anyhow::{bail, Context, Result};
use reqwest::Method;

pub use client::{ClientOptions, HarajClient};
pub use request::{ApiError, ApiRequest, ApiResponse};

/// Show current user info
pub async fn whoami(options: &ClientOptions) -> Result<()> {
    me::whoami(options).await
}

/// Send an arbitrary authenticated request and print the response body.
pub async fn request(
    options: &ClientOptions,
    method: &str,
    path: &str,
    data: Option<&str>,
    query: &[String],
) -> Result<()> {
    let request = build_request(method, path, data, query)?;
    let client = HarajClient::connect(options)?;
    let resp = client.send(request).await?;

    tracing::debug!("HTTP {}", resp.status.as_u16());
    match resp.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", resp.text()),
    }
    Ok(())
}

fn build_request(
    method: &str,
    path: &str,
    data: Option<&str>,
    query: &[String],
) -> Result<ApiRequest> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let mut request = ApiRequest::new(method, path);
    for pair in query {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Query parameters must look like key=value, got: {}", pair);
        };
        request = request.with_query(key, value);
    }
    if let Some(data) = data {
        let body = serde_json::from_str(data).context("--data is not valid JSON")?;
        request = request.with_json(body);
    }
    Ok(request)
}
