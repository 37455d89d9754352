//! AbuseIPDB abuse-report provider.

use super::{check_status, http_client, ProviderError, Signal, SignalProvider};
use crate::config::AbuseIPDBConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// AbuseIPDB API response.
#[derive(Debug, Deserialize)]
struct AbuseIPDBResponse {
    data: AbuseIPDBData,
}

#[derive(Debug, Deserialize)]
struct AbuseIPDBData {
    /// Abuse confidence score (0-100).
    #[serde(rename = "abuseConfidenceScore")]
    abuse_confidence_score: u8,

    #[serde(rename = "totalReports")]
    total_reports: u32,

    #[serde(rename = "isTor", default)]
    is_tor: bool,

    #[serde(rename = "isPublicProxy", default)]
    is_public_proxy: bool,

    #[serde(rename = "countryCode", default)]
    country_code: Option<String>,

    #[serde(default)]
    isp: Option<String>,

    /// e.g. "Data Center/Web Hosting/Transit".
    #[serde(rename = "usageType", default)]
    usage_type: Option<String>,
}

impl AbuseIPDBData {
    fn into_signal(self, source: &str) -> Signal {
        let is_hosting = self
            .usage_type
            .as_deref()
            .map(|u| u.contains("Data Center") || u.contains("Hosting"));

        Signal {
            organization: self.isp,
            country: self.country_code,
            is_tor: Some(self.is_tor),
            is_proxy: Some(self.is_public_proxy),
            is_hosting,
            risk_score: Some(self.abuse_confidence_score.min(100)),
            abuse_reports: Some(self.total_reports),
            ..Signal::new(source)
        }
    }
}

/// AbuseIPDB provider.
pub struct AbuseIPDBProvider {
    config: AbuseIPDBConfig,
    client: Client,
}

impl AbuseIPDBProvider {
    pub fn new(config: AbuseIPDBConfig, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl SignalProvider for AbuseIPDBProvider {
    async fn lookup(&self, ip: &IpAddr) -> Result<Signal, ProviderError> {
        let url = format!(
            "https://api.abuseipdb.com/api/v2/check?ipAddress={}&maxAgeInDays={}",
            ip, self.config.max_age_days
        );

        debug!(ip = %ip, "Querying AbuseIPDB");

        let response = self
            .client
            .get(&url)
            .header("Key", &self.config.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let api_response: AbuseIPDBResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let data = api_response.data;
        debug!(
            ip = %ip,
            score = data.abuse_confidence_score,
            reports = data.total_reports,
            is_tor = data.is_tor,
            "AbuseIPDB lookup complete"
        );

        Ok(data.into_signal(self.name()))
    }

    fn name(&self) -> &str {
        "abuseipdb"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> AbuseIPDBConfig {
        AbuseIPDBConfig {
            enabled: true,
            api_key: "test-key".to_string(),
            max_age_days: 90,
        }
    }

    #[test]
    fn test_provider_name_and_enabled() {
        let provider = AbuseIPDBProvider::new(create_test_config(), Duration::from_secs(5)).unwrap();
        assert_eq!(provider.name(), "abuseipdb");
        assert!(provider.is_enabled());

        let mut config = create_test_config();
        config.enabled = false;
        let provider = AbuseIPDBProvider::new(config, Duration::from_secs(5)).unwrap();
        assert!(!provider.is_enabled());
    }

    #[test]
    fn test_response_to_signal() {
        let body = r#"{"data":{
            "ipAddress":"185.220.101.1","abuseConfidenceScore":100,"totalReports":412,
            "isTor":true,"isPublicProxy":false,"countryCode":"DE","isp":"Tor Exit",
            "usageType":"Data Center/Web Hosting/Transit"}}"#;
        let parsed: AbuseIPDBResponse = serde_json::from_str(body).unwrap();
        let signal = parsed.data.into_signal("abuseipdb");

        assert_eq!(signal.source, "abuseipdb");
        assert_eq!(signal.risk_score, Some(100));
        assert_eq!(signal.abuse_reports, Some(412));
        assert_eq!(signal.is_tor, Some(true));
        assert_eq!(signal.is_hosting, Some(true));
        assert_eq!(signal.country.as_deref(), Some("DE"));
    }

    #[test]
    fn test_missing_usage_type() {
        let body = r#"{"data":{"abuseConfidenceScore":0,"totalReports":0}}"#;
        let parsed: AbuseIPDBResponse = serde_json::from_str(body).unwrap();
        let signal = parsed.data.into_signal("abuseipdb");
        assert_eq!(signal.is_hosting, None);
        assert_eq!(signal.is_tor, Some(false));
    }
}
