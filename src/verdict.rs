//! Fused risk verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Best-guess classification of an origin's network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    #[serde(rename = "TOR")]
    Tor,
    #[serde(rename = "VPN")]
    Vpn,
    Proxy,
    Hosting,
    Residential,
    Suspicious,
}

impl Classification {
    /// Specificity rank used when several types were detected.
    pub(crate) fn specificity(&self) -> u8 {
        match self {
            Classification::Tor => 4,
            Classification::Vpn => 3,
            Classification::Proxy => 2,
            Classification::Hosting => 1,
            Classification::Residential | Classification::Suspicious => 0,
        }
    }

    /// Whether the classification names anonymizing infrastructure.
    pub fn is_confirmed_proxy(&self) -> bool {
        matches!(
            self,
            Classification::Tor | Classification::Vpn | Classification::Proxy
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Classification::Tor => "TOR",
            Classification::Vpn => "VPN",
            Classification::Proxy => "Proxy",
            Classification::Hosting => "Hosting",
            Classification::Residential => "Residential",
            Classification::Suspicious => "Suspicious",
        };
        f.write_str(name)
    }
}

/// How much of the provider ensemble contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Every enabled provider answered.
    Full,
    /// Some providers failed or timed out.
    Partial,
    /// No provider answered; the score is a conservative default.
    Unknown,
}

/// Fused result for one origin at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub score: u8,
    pub flags: Vec<String>,
    pub classification: Classification,
    pub operator: Option<String>,
    pub asn: Option<u32>,
    pub confidence: Confidence,
    pub checked_at: DateTime<Utc>,
    /// Set by the orchestrator's expiry policy; `None` until persisted.
    pub expires_at: Option<DateTime<Utc>>,
}

impl RiskVerdict {
    /// Default verdict when nothing could be learned about the origin.
    pub fn unknown(default_score: u8) -> Self {
        Self {
            score: default_score.min(100),
            flags: vec!["lookup_failed".to_string()],
            classification: Classification::Residential,
            operator: None,
            asn: None,
            confidence: Confidence::Unknown,
            checked_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Verdict for allowlisted origins.
    pub fn clean() -> Self {
        Self {
            score: 0,
            flags: vec!["allowlisted".to_string()],
            classification: Classification::Residential,
            operator: None,
            asn: None,
            confidence: Confidence::Full,
            checked_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at <= now)
    }
}
