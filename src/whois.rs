//! Network ownership lookups over RDAP.

use crate::providers::{check_status, http_client, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Who owns the network an address belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub asn: Option<u32>,
    pub org: Option<String>,
    pub country: Option<String>,
    /// CIDR or "start - end" range.
    pub range: Option<String>,
    /// Registry that answered, e.g. its WHOIS server.
    pub referral: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NetworkInfo {
    /// Empty record standing in for a failed or empty lookup.
    pub fn unresolved(fetched_at: DateTime<Utc>) -> Self {
        Self {
            asn: None,
            org: None,
            country: None,
            range: None,
            referral: None,
            fetched_at,
            expires_at: None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.asn.is_none() && self.org.is_none() && self.country.is_none() && self.range.is_none()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at <= now)
    }
}

/// WHOIS-equivalent ownership lookup. `Ok(None)` means the registry has no record.
#[async_trait]
pub trait NetworkLookup: Send + Sync {
    async fn lookup(&self, ip: &IpAddr) -> Result<Option<NetworkInfo>, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct RdapNetwork {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(rename = "startAddress", default)]
    start_address: Option<String>,
    #[serde(rename = "endAddress", default)]
    end_address: Option<String>,
    #[serde(default)]
    port43: Option<String>,
    #[serde(rename = "cidr0_cidrs", default)]
    cidrs: Vec<RdapCidr>,
    #[serde(rename = "arin_originas0_originautnums", default)]
    origin_asns: Vec<u32>,
    #[serde(default)]
    entities: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RdapCidr {
    #[serde(default)]
    v4prefix: Option<String>,
    #[serde(default)]
    v6prefix: Option<String>,
    length: u8,
}

impl RdapNetwork {
    fn into_info(self) -> NetworkInfo {
        let range = self
            .cidrs
            .first()
            .and_then(|c| {
                c.v4prefix
                    .as_ref()
                    .or(c.v6prefix.as_ref())
                    .map(|p| format!("{}/{}", p, c.length))
            })
            .or_else(|| match (&self.start_address, &self.end_address) {
                (Some(start), Some(end)) => Some(format!("{} - {}", start, end)),
                _ => None,
            });

        let org = registrant_name(&self.entities).or(self.name);

        NetworkInfo {
            asn: self.origin_asns.first().copied(),
            org,
            country: self.country,
            range,
            referral: self.port43,
            fetched_at: Utc::now(),
            expires_at: None,
        }
    }
}

/// Full name from the first registrant entity's vCard.
fn registrant_name(entities: &[Value]) -> Option<String> {
    entities
        .iter()
        .filter(|e| {
            e.get("roles")
                .and_then(Value::as_array)
                .map_or(false, |roles| roles.iter().any(|r| r == "registrant"))
        })
        .find_map(|e| {
            let props = e.get("vcardArray")?.get(1)?.as_array()?;
            props.iter().find_map(|prop| {
                let prop = prop.as_array()?;
                if prop.first()?.as_str()? == "fn" {
                    prop.get(3)?.as_str().map(str::to_string)
                } else {
                    None
                }
            })
        })
}

/// RDAP bootstrap lookups.
pub struct RdapLookup {
    base_url: String,
    client: Client,
}

impl RdapLookup {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl NetworkLookup for RdapLookup {
    async fn lookup(&self, ip: &IpAddr) -> Result<Option<NetworkInfo>, ProviderError> {
        let url = format!("{}/ip/{}", self.base_url, ip);
        debug!(ip = %ip, "Querying RDAP");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/rdap+json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let network: RdapNetwork = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse RDAP: {}", e)))?;

        Ok(Some(network.into_info()))
    }
}
