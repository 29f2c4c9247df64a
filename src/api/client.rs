//! Authenticated HTTP client for the gateway REST API
//!
//! Wraps reqwest::Client with bearer token injection and uniform status
//! checking.

use anyhow::{Context, Result};
use thiserror::Error;
use url::Url;

use crate::auth;
use crate::config::Config;

/// Non-success HTTP outcome. Kept typed so callers can classify by status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("401 Unauthorized for {url}. Token may be invalid -- run 'eldor-cli login'.")]
    Unauthorized { url: String },

    #[error("HTTP {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Unauthorized { .. } => 401,
            ApiError::Status { status, .. } => *status,
        }
    }
}

/// Client for the gateway's `/api/...` routes.
pub struct GatewayClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl GatewayClient {
    /// Build a client from config, resolving the bearer token.
    pub fn new(config: &Config) -> Result<Self> {
        let token = auth::resolve_token(config)?;
        Self::with_token(&config.api_base, &token)
    }

    pub fn with_token(api_base: &str, token: &str) -> Result<Self> {
        let base = Url::parse(api_base)
            .with_context(|| format!("Invalid API base URL: {}", api_base))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token: token.to_string(),
        })
    }

    /// Bearer token in use (also valid for the WebSocket).
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Build `<base>/api/<segments...>`, percent-encoding each segment.
    pub fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("API base URL cannot be a base: {}", self.base))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    /// GET request with bearer auth.
    pub async fn get(&self, url: Url) -> Result<reqwest::Response> {
        tracing::debug!("GET {}", url);

        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        check_response(resp, url.as_str()).await
    }

    /// POST a JSON body with bearer auth.
    pub async fn post_json(
        &self,
        url: Url,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        tracing::debug!("POST {}", url);

        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check_response(resp, url.as_str()).await
    }

    /// POST a multipart form with bearer auth.
    pub async fn post_multipart(
        &self,
        url: Url,
        form: reqwest::multipart::Form,
    ) -> Result<reqwest::Response> {
        tracing::debug!("POST (multipart) {}", url);

        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check_response(resp, url.as_str()).await
    }

    /// DELETE request with bearer auth.
    pub async fn delete(&self, url: Url) -> Result<reqwest::Response> {
        tracing::debug!("DELETE {}", url);

        let resp = self
            .http
            .delete(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", url))?;

        check_response(resp, url.as_str()).await
    }
}

/// Check HTTP response status code and return a typed error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized {
            url: url.to_string(),
        }
        .into());
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        }
        .into());
    }
    Ok(resp)
}

/// Read a response body as JSON, treating an empty body as `null`.
pub async fn json_body(resp: reqwest::Response) -> Result<serde_json::Value> {
    let text = resp.text().await.context("Failed to read response body")?;
    if text.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(&text).context("Failed to parse response JSON")
}
