//! HTTP fallback retrieval
//!
//! Plain GETs against a resource's fallback URL, optionally rewritten onto a
//! mirror host. A transport error against the (mirrored) URL degrades to one
//! direct load of the original URL through a bare client.

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use webcdn_config::DownloadConfig;

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },
}

impl FallbackError {
    /// The server never answered
    fn is_transport(&self) -> bool {
        matches!(self, FallbackError::Http(e) if e.status().is_none())
    }
}

/// Fallback origin client
#[derive(Clone)]
pub struct FallbackClient {
    http: reqwest::Client,
    /// No default headers, no proxy; used for the last-resort direct load
    direct: reqwest::Client,
    mirror_host: Option<String>,
    timeout: Duration,
}

impl FallbackClient {
    pub fn new(timeout: Duration) -> Result<Self, FallbackError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("webcdn/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let direct = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            direct,
            mirror_host: None,
            timeout,
        })
    }

    pub fn from_config(config: &DownloadConfig) -> Result<Self, FallbackError> {
        let client = Self::new(config.fallback_timeout())?;
        Ok(match &config.mirror_host {
            Some(host) => client.with_mirror_host(host.clone()),
            None => client,
        })
    }

    /// Serve fallback URLs from `host` instead of their origin
    pub fn with_mirror_host(mut self, host: impl Into<String>) -> Self {
        self.mirror_host = Some(host.into());
        self
    }

    pub fn mirror_host(&self) -> Option<&str> {
        self.mirror_host.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// URL actually requested for `url`
    pub fn resolve_url(&self, url: &str) -> String {
        match &self.mirror_host {
            Some(host) => mirror_url(host, url),
            None => url.to_string(),
        }
    }

    /// Fetch `url` as raw bytes
    pub async fn fetch(&self, url: &str) -> Result<Bytes, FallbackError> {
        let target = self.resolve_url(url);
        debug!("Fallback GET {}", target);

        match get(&self.http, &target).await {
            Err(e) if e.is_transport() => {
                warn!("Fallback to {} failed ({}), trying direct load", target, e);
                get(&self.direct, url).await
            }
            result => result,
        }
    }
}

async fn get(client: &reqwest::Client, url: &str) -> Result<Bytes, FallbackError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FallbackError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response.bytes().await?;
    debug!("Fallback {} returned {} bytes", url, body.len());
    Ok(body)
}

/// `mirror + host/path`: the scheme and a leading slash are dropped
fn mirror_url(mirror: &str, url: &str) -> String {
    let rest = match url.rfind("//") {
        Some(idx) => &url[idx + 2..],
        None => url,
    };
    let rest = rest.trim_start_matches('/');
    if mirror.ends_with('/') {
        format!("{}{}", mirror, rest)
    } else {
        format!("{}/{}", mirror, rest)
    }
}
