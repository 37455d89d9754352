//! Reputation signal providers.
//!
//! Each provider answers independently with a partial [`Signal`]. A failed or
//! slow provider only removes its own contribution from the fused score.

pub mod abuseipdb;
pub mod getipintel;
pub mod ip_api;
pub mod port_probe;
pub mod proxycheck;
pub mod reverse_dns;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// One provider's observation about an address. Absent fields mean "no opinion".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Which provider produced this signal.
    pub source: String,
    pub asn: Option<u32>,
    /// Organization or ISP name.
    pub organization: Option<String>,
    pub country: Option<String>,
    pub is_proxy: Option<bool>,
    pub is_vpn: Option<bool>,
    pub is_tor: Option<bool>,
    pub is_hosting: Option<bool>,
    /// Provider risk/fraud/abuse score, 0-100.
    pub risk_score: Option<u8>,
    /// Proxy probability, 0.0-1.0.
    pub probability: Option<f64>,
    pub abuse_reports: Option<u32>,
    pub open_ports: Vec<u16>,
}

impl Signal {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }
}

/// Error from a signal provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("Rate limited")]
    RateLimited,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(e)
        }
    }
}

/// Trait for reputation signal providers.
#[async_trait]
pub trait SignalProvider: Send + Sync {
    /// Look up an address.
    async fn lookup(&self, ip: &IpAddr) -> Result<Signal, ProviderError>;

    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Whether this provider is enabled.
    fn is_enabled(&self) -> bool;
}

/// PTR lookups. `Ok(None)` means the address has no PTR record.
#[async_trait]
pub trait ReverseDns: Send + Sync {
    async fn reverse(&self, ip: &IpAddr) -> Result<Option<String>, ProviderError>;
}

/// Active TCP probing for open proxy ports.
#[async_trait]
pub trait PortProber: Send + Sync {
    /// Returns the subset of `ports` accepting connections.
    async fn probe(&self, ip: &IpAddr, ports: &[u16]) -> Vec<u16>;
}

/// Shared HTTP client for providers.
pub(crate) fn http_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("canvas-abuse-guard/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(ProviderError::Http)
}

/// Check the status line and surface 429s as [`ProviderError::RateLimited`].
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::InvalidResponse(format!(
            "HTTP {}: {}",
            status, body
        )));
    }

    Ok(response)
}

/// Parse "AS15169 Google LLC" or "AS15169" into 15169.
pub(crate) fn parse_asn(raw: &str) -> Option<u32> {
    let token = raw.split_whitespace().next()?;
    let digits = token
        .strip_prefix("AS")
        .or_else(|| token.strip_prefix("as"))
        .unwrap_or(token);
    digits.parse().ok()
}
