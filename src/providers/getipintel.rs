//! getipintel.net proxy probability provider.

use super::{check_status, http_client, ProviderError, Signal, SignalProvider};
use crate::config::GetIpIntelConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct GetIpIntelResponse {
    status: String,
    /// Probability as a string; negative values are error codes.
    result: String,
    #[serde(default)]
    message: Option<String>,
}

impl GetIpIntelResponse {
    fn into_signal(self, source: &str) -> Result<Signal, ProviderError> {
        if self.status != "success" {
            return Err(ProviderError::InvalidResponse(
                self.message.unwrap_or(self.status),
            ));
        }

        let probability: f64 = self
            .result
            .trim()
            .parse()
            .map_err(|_| ProviderError::InvalidResponse(format!("bad result: {}", self.result)))?;

        if !(0.0..=1.0).contains(&probability) {
            return Err(ProviderError::InvalidResponse(format!(
                "error code {}",
                self.result
            )));
        }

        Ok(Signal {
            probability: Some(probability),
            ..Signal::new(source)
        })
    }
}

/// getipintel.net provider.
pub struct GetIpIntelProvider {
    config: GetIpIntelConfig,
    client: Client,
}

impl GetIpIntelProvider {
    pub fn new(config: GetIpIntelConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl SignalProvider for GetIpIntelProvider {
    async fn lookup(&self, ip: &IpAddr) -> Result<Signal, ProviderError> {
        let ip_str = ip.to_string();
        debug!(ip = %ip, "Querying getipintel");

        let response = self
            .client
            .get("https://check.getipintel.net/check.php")
            .query(&[
                ("ip", ip_str.as_str()),
                ("contact", self.config.contact.as_str()),
                ("format", "json"),
            ])
            .send()
            .await?;

        let parsed: GetIpIntelResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        parsed.into_signal(self.name())
    }

    fn name(&self) -> &str {
        "getipintel"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
