//! ip-api.com geo/ASN provider with proxy and hosting flags.

use super::{check_status, http_client, parse_asn, ProviderError, Signal, SignalProvider};
use crate::config::IpApiConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const FIELDS: &str = "status,message,countryCode,isp,org,as,proxy,hosting";

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "countryCode", default)]
    country_code: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(rename = "as", default)]
    as_field: Option<String>,
    #[serde(default)]
    proxy: Option<bool>,
    #[serde(default)]
    hosting: Option<bool>,
}

impl IpApiResponse {
    fn into_signal(self, source: &str) -> Result<Signal, ProviderError> {
        if self.status != "success" {
            return Err(ProviderError::InvalidResponse(
                self.message.unwrap_or_else(|| self.status.clone()),
            ));
        }

        let organization = self.org.filter(|o| !o.is_empty()).or(self.isp);

        Ok(Signal {
            asn: self.as_field.as_deref().and_then(parse_asn),
            organization,
            country: self.country_code,
            is_proxy: self.proxy,
            is_hosting: self.hosting,
            ..Signal::new(source)
        })
    }
}

/// ip-api.com provider.
pub struct IpApiProvider {
    config: IpApiConfig,
    client: Client,
}

impl IpApiProvider {
    pub fn new(config: IpApiConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl SignalProvider for IpApiProvider {
    async fn lookup(&self, ip: &IpAddr) -> Result<Signal, ProviderError> {
        let url = format!(
            "{}/{}?fields={}",
            self.config.base_url.trim_end_matches('/'),
            ip,
            FIELDS
        );

        debug!(ip = %ip, "Querying ip-api");

        let parsed: IpApiResponse = check_status(self.client.get(&url).send().await?)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        parsed.into_signal(self.name())
    }

    fn name(&self) -> &str {
        "ip-api"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response() {
        let body = r#"{"status":"success","countryCode":"US","isp":"DigitalOcean, LLC",
            "org":"DigitalOcean, LLC","as":"AS14061 DigitalOcean, LLC","proxy":false,"hosting":true}"#;
        let parsed: IpApiResponse = serde_json::from_str(body).unwrap();
        let signal = parsed.into_signal("ip-api").unwrap();

        assert_eq!(signal.asn, Some(14061));
        assert_eq!(signal.organization.as_deref(), Some("DigitalOcean, LLC"));
        assert_eq!(signal.is_hosting, Some(true));
        assert_eq!(signal.is_proxy, Some(false));
    }

    #[test]
    fn test_empty_org_falls_back_to_isp() {
        let body = r#"{"status":"success","isp":"Comcast Cable","org":"","as":"AS7922"}"#;
        let parsed: IpApiResponse = serde_json::from_str(body).unwrap();
        let signal = parsed.into_signal("ip-api").unwrap();
        assert_eq!(signal.organization.as_deref(), Some("Comcast Cable"));
        assert_eq!(signal.asn, Some(7922));
    }

    #[test]
    fn test_fail_response() {
        let body = r#"{"status":"fail","message":"reserved range"}"#;
        let parsed: IpApiResponse = serde_json::from_str(body).unwrap();
        let err = parsed.into_signal("ip-api").unwrap_err();
        assert!(err.to_string().contains("reserved range"));
    }
}
