//! Cloud reachability checks
//!
//! A probe answers one question cheaply: is it worth attempting a sync cycle
//! right now? Its answer is advisory. A batch write can still fail right after
//! a positive probe, and the daemon handles that like any other write failure.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{CloudConfig, ProbeKind};
use crate::error::{Error, Result};

/// Lightweight reachability check against the cloud endpoint.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// True if the endpoint answered within the probe timeout.
    async fn is_reachable(&self) -> bool;
}

/// Build the probe selected by `cloud.probe`
pub fn from_config(config: &CloudConfig) -> Result<Box<dyn ConnectivityProbe>> {
    let endpoint = config
        .endpoint
        .as_deref()
        .ok_or_else(|| Error::Config("cloud.endpoint is required".to_string()))?;

    Ok(match config.probe {
        ProbeKind::Http => Box::new(HttpProbe::new(endpoint, config.probe_timeout())?),
        ProbeKind::Tcp => Box::new(TcpProbe::from_url(endpoint, config.probe_timeout())?),
    })
}

/// `GET {endpoint}/health`, reachable on any 2xx
pub struct HttpProbe {
    http_client: reqwest::Client,
    health_url: String,
}

impl HttpProbe {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            health_url: format!("{}/health", endpoint.trim_end_matches('/')),
        })
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.http_client.get(&self.health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, url = %self.health_url, "Health check failed");
                false
            }
        }
    }
}

/// TCP connect to the endpoint's host and port, nothing more
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Derive `host:port` from an http(s) URL, using the scheme's default port
    pub fn from_url(endpoint: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid cloud.endpoint: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config("cloud.endpoint has no host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Config("cloud.endpoint has no port".to_string()))?;
        Ok(Self::new(format!("{}:{}", host, port), timeout))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.addr)).await
        {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, addr = %self.addr, "TCP probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, "TCP probe timed out");
                false
            }
        }
    }
}
