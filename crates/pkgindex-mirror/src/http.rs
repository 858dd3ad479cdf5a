//! Upstream HTTP client
//!
//! The mirror only depends on the [`UpstreamClient`] contract: GET with
//! redirect control, a per-call timeout, extra headers, and a response
//! carrying status, headers, final URL and body text.

use crate::error::{MirrorError, MirrorResult};
use async_trait::async_trait;
use reqwest::redirect::Policy;
use std::collections::HashMap;
use std::time::Duration;

/// Upstream serial of the requested page
pub const H_PYPI_LAST_SERIAL: &str = "x-pypi-last-serial";
/// Keyfs serial of the primary after it handled a replica request
pub const H_DEVPI_SERIAL: &str = "x-devpi-serial";
/// Identifies the requesting replica to the primary
pub const H_REPLICA_UUID: &str = "X-Devpi-Replica-Uuid";

/// One GET request
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub url: String,
    pub allow_redirects: bool,
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
}

impl UpstreamRequest {
    #[must_use]
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            allow_redirects: true,
            timeout,
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Response of an upstream GET
#[derive(Clone, Debug, Default)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    /// URL after redirects
    pub url: String,
    pub text: String,
}

impl UpstreamResponse {
    /// Header value by case-insensitive name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// HTTP transport used for upstream requests
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn get(&self, request: UpstreamRequest) -> MirrorResult<UpstreamResponse>;
}

/// [`UpstreamClient`] backed by reqwest
pub struct ReqwestClient {
    follow: reqwest::Client,
    no_follow: reqwest::Client,
}

impl ReqwestClient {
    /// Create clients sending `user_agent`
    pub fn new(user_agent: &str) -> MirrorResult<Self> {
        let build = |policy: Policy| {
            reqwest::Client::builder()
                .user_agent(user_agent)
                .redirect(policy)
                .build()
                .map_err(|e| MirrorError::Upstream(format!("cannot build http client: {e}")))
        };
        Ok(Self {
            follow: build(Policy::limited(10))?,
            no_follow: build(Policy::none())?,
        })
    }
}

#[async_trait]
impl UpstreamClient for ReqwestClient {
    async fn get(&self, request: UpstreamRequest) -> MirrorResult<UpstreamResponse> {
        let client = if request.allow_redirects {
            &self.follow
        } else {
            &self.no_follow
        };
        let mut builder = client.get(&request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                MirrorError::Upstream(format!(
                    "timeout after {:?} on GET {:?}",
                    request.timeout, request.url
                ))
            } else {
                MirrorError::Upstream(format!("GET {:?} failed: {}", request.url, e))
            }
        })?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| MirrorError::Upstream(format!("reading {url:?} failed: {e}")))?;
        Ok(UpstreamResponse {
            status,
            headers,
            url,
            text,
        })
    }
}
