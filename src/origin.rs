//! Request origin identity.

use crate::config::IpExtractionConfig;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Rejected origin input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginError {
    #[error("empty address")]
    Empty,
    #[error("malformed address: {0}")]
    Malformed(String),
}

/// An address under evaluation, optionally tied to an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    ip: IpAddr,
    user_id: Option<String>,
}

impl Origin {
    /// Parse and normalize an address string.
    ///
    /// IPv4-mapped IPv6 addresses collapse to plain IPv4 so both spellings
    /// share per-origin state.
    pub fn parse(addr: &str) -> Result<Self, OriginError> {
        let trimmed = addr.trim();
        if trimmed.is_empty() {
            return Err(OriginError::Empty);
        }
        let ip: IpAddr = trimmed
            .parse()
            .map_err(|_| OriginError::Malformed(trimmed.to_string()))?;
        Ok(Self::from_ip(ip))
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip: ip.to_canonical(),
            user_id: None,
        }
    }

    /// Attach an authenticated user id. Blank ids are ignored.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let user_id = user_id.trim();
        self.user_id = if user_id.is_empty() {
            None
        } else {
            Some(user_id.to_string())
        };
        self
    }

    /// Extract the client address from forwarding headers.
    ///
    /// Header names are matched case-insensitively in configured order.
    pub fn from_headers(
        headers: &HashMap<String, String>,
        config: &IpExtractionConfig,
    ) -> Option<Self> {
        let lowered: HashMap<String, &String> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();

        for header_name in &config.headers {
            if let Some(value) = lowered.get(&header_name.to_lowercase()) {
                let candidate = if config.use_first_ip {
                    // X-Forwarded-For: client, proxy1, proxy2
                    value.split(',').next()
                } else {
                    value.split(',').last()
                };

                if let Some(Ok(origin)) = candidate.map(Origin::parse) {
                    return Some(origin);
                }
            }
        }
        None
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Key for per-origin state maps.
    pub fn key(&self) -> String {
        match &self.user_id {
            Some(user) => format!("{}#{}", self.ip, user),
            None => self.ip.to_string(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
