//! Reverse DNS over DNS-over-HTTPS JSON.

use super::{check_status, http_client, ProviderError, ReverseDns};
use crate::config::ReverseDnsConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const PTR: u16 = 12;
const NXDOMAIN: u32 = 3;

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

impl DohResponse {
    fn hostname(self) -> Result<Option<String>, ProviderError> {
        if self.status == NXDOMAIN {
            return Ok(None);
        }
        if self.status != 0 {
            return Err(ProviderError::InvalidResponse(format!(
                "DNS status {}",
                self.status
            )));
        }

        Ok(self
            .answer
            .into_iter()
            .find(|a| a.record_type == PTR)
            .map(|a| a.data.trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty()))
    }
}

/// Build the `in-addr.arpa` / `ip6.arpa` name for an address.
pub fn reverse_name(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut labels = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0x0f));
                labels.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa", labels.join("."))
        }
    }
}

/// DoH-backed PTR resolver.
pub struct DohReverseDns {
    config: ReverseDnsConfig,
    client: Client,
}

impl DohReverseDns {
    pub fn new(config: ReverseDnsConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl ReverseDns for DohReverseDns {
    async fn reverse(&self, ip: &IpAddr) -> Result<Option<String>, ProviderError> {
        let name = reverse_name(ip);
        debug!(ip = %ip, name = %name, "Resolving PTR");

        let response = self
            .client
            .get(&self.config.resolver_url)
            .header("Accept", "application/dns-json")
            .query(&[("name", name.as_str()), ("type", "PTR")])
            .send()
            .await?;

        let parsed: DohResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        parsed.hostname()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_name_v4() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(reverse_name(&ip), "7.113.0.203.in-addr.arpa");
    }

    #[test]
    fn test_reverse_name_v6() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let name = reverse_name(&ip);
        assert!(name.starts_with("1.0.0.0.0.0.0.0"));
        assert!(name.ends_with("8.b.d.0.1.0.0.2.ip6.arpa"));
    }

    #[test]
    fn test_ptr_answer() {
        let parsed: DohResponse = serde_json::from_str(
            r#"{"Status":0,"Answer":[{"name":"x","type":12,"TTL":300,"data":"Exit-Relay.Example.NET."}]}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.hostname().unwrap().as_deref(),
            Some("exit-relay.example.net")
        );
    }

    #[test]
    fn test_no_ptr() {
        let nx: DohResponse = serde_json::from_str(r#"{"Status":3}"#).unwrap();
        assert_eq!(nx.hostname().unwrap(), None);

        let empty: DohResponse = serde_json::from_str(r#"{"Status":0}"#).unwrap();
        assert_eq!(empty.hostname().unwrap(), None);

        let servfail: DohResponse = serde_json::from_str(r#"{"Status":2}"#).unwrap();
        assert!(servfail.hostname().is_err());
    }
}
