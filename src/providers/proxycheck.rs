//! proxycheck.io proxy/VPN classifier.

use super::{check_status, http_client, parse_asn, ProviderError, Signal, SignalProvider};
use crate::config::ProxyCheckConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Per-address record. The response keys it by the queried address.
#[derive(Debug, Deserialize)]
struct ProxyCheckEntry {
    #[serde(default)]
    asn: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    organisation: Option<String>,
    #[serde(default)]
    isocode: Option<String>,
    #[serde(default)]
    proxy: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    risk: Option<u8>,
}

impl ProxyCheckEntry {
    fn into_signal(self, source: &str) -> Signal {
        let listed = self.proxy.as_deref() == Some("yes");
        let kind = self.kind.as_deref().unwrap_or("").to_ascii_lowercase();

        let (is_proxy, is_vpn, is_tor) = if listed {
            match kind.as_str() {
                "vpn" => (Some(false), Some(true), Some(false)),
                "tor" => (Some(false), Some(false), Some(true)),
                _ => (Some(true), Some(false), Some(false)),
            }
        } else {
            (Some(false), None, None)
        };

        Signal {
            asn: self.asn.as_deref().and_then(parse_asn),
            organization: self.organisation.or(self.provider),
            country: self.isocode,
            is_proxy,
            is_vpn,
            is_tor,
            is_hosting: (kind == "hosting").then_some(true),
            risk_score: self.risk.map(|r| r.min(100)),
            ..Signal::new(source)
        }
    }
}

fn parse_body(body: Value, ip: &IpAddr, source: &str) -> Result<Signal, ProviderError> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("");
    if status != "ok" && status != "warning" {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(status)
            .to_string();
        return Err(ProviderError::InvalidResponse(message));
    }

    let entry = body
        .get(ip.to_string())
        .cloned()
        .ok_or_else(|| ProviderError::InvalidResponse("missing address entry".to_string()))?;

    let entry: ProxyCheckEntry = serde_json::from_value(entry)
        .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse entry: {}", e)))?;

    Ok(entry.into_signal(source))
}

/// proxycheck.io provider.
pub struct ProxyCheckProvider {
    config: ProxyCheckConfig,
    client: Client,
}

impl ProxyCheckProvider {
    pub fn new(config: ProxyCheckConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl SignalProvider for ProxyCheckProvider {
    async fn lookup(&self, ip: &IpAddr) -> Result<Signal, ProviderError> {
        let mut url = format!("https://proxycheck.io/v2/{}?vpn=1&asn=1&risk=1", ip);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            url.push_str("&key=");
            url.push_str(key);
        }

        debug!(ip = %ip, "Querying proxycheck");

        let body: Value = check_status(self.client.get(&url).send().await?)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        parse_body(body, ip, self.name())
    }

    fn name(&self) -> &str {
        "proxycheck"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
