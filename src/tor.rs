//! Tor exit node registry.
//!
//! Holds an immutable [`TorSnapshot`] behind an `Arc`. Refreshes build a new
//! snapshot and swap it in whole, so lookups never see a half-loaded list.
//! Every accepted snapshot is written to a local cache file, which is read
//! back at startup.

use crate::config::TorConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const V4_PREFIX: u8 = 24;
const V6_PREFIX: u8 = 48;

/// Error refreshing or persisting the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("implausible exit list: {count} entries, need at least {min}")]
    Implausible { count: usize, min: usize },
    #[error("all exit list sources failed")]
    AllSourcesFailed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache file error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Exit addresses plus their derived subnets.
#[derive(Debug, Clone)]
pub struct TorSnapshot {
    addresses: HashSet<IpAddr>,
    subnets: HashSet<IpNet>,
    updated_at: Option<DateTime<Utc>>,
}

impl TorSnapshot {
    pub fn empty() -> Self {
        Self {
            addresses: HashSet::new(),
            subnets: HashSet::new(),
            updated_at: None,
        }
    }

    pub fn new(addresses: impl IntoIterator<Item = IpAddr>, updated_at: DateTime<Utc>) -> Self {
        let addresses: HashSet<IpAddr> =
            addresses.into_iter().map(|ip| ip.to_canonical()).collect();
        let subnets = addresses.iter().filter_map(subnet_of).collect();
        Self {
            addresses,
            subnets,
            updated_at: Some(updated_at),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addresses.contains(&ip.to_canonical())
    }

    pub fn subnet_contains(&self, ip: &IpAddr) -> bool {
        subnet_of(&ip.to_canonical()).map_or(false, |net| self.subnets.contains(&net))
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

/// The /24 (IPv4) or /48 (IPv6) network containing `ip`.
fn subnet_of(ip: &IpAddr) -> Option<IpNet> {
    let prefix = match ip {
        IpAddr::V4(_) => V4_PREFIX,
        IpAddr::V6(_) => V6_PREFIX,
    };
    IpNet::new(*ip, prefix).ok().map(|net| net.trunc())
}

/// On-disk cache format.
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    updated_at: DateTime<Utc>,
    addresses: Vec<IpAddr>,
}

/// Parse a plain exit list, one address per line.
pub fn parse_exit_list(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.parse().ok())
        .collect()
}

/// A place exit lists can be fetched from.
#[async_trait]
pub trait ExitListSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IpAddr>, RegistryError>;

    fn name(&self) -> &str;
}

/// Plain-text exit list served over HTTP.
pub struct HttpExitListSource {
    url: String,
    client: Client,
}

impl HttpExitListSource {
    pub fn new(url: &str) -> Result<Self, RegistryError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl ExitListSource for HttpExitListSource {
    async fn fetch(&self) -> Result<Vec<IpAddr>, RegistryError> {
        debug!(url = %self.url, "Fetching Tor exit node list");

        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status()));
        }

        let content = response.text().await?;
        Ok(parse_exit_list(&content))
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// Tor exit registry.
pub struct TorRegistry {
    config: TorConfig,
    sources: Vec<Box<dyn ExitListSource>>,
    snapshot: RwLock<Arc<TorSnapshot>>,
}

impl TorRegistry {
    /// Build a registry fetching from the configured primary and fallback URLs.
    pub fn new(config: TorConfig) -> Result<Self, RegistryError> {
        let mut sources: Vec<Box<dyn ExitListSource>> =
            vec![Box::new(HttpExitListSource::new(&config.primary_url)?)];
        if !config.fallback_url.is_empty() {
            sources.push(Box::new(HttpExitListSource::new(&config.fallback_url)?));
        }
        Ok(Self::with_sources(config, sources))
    }

    /// Build a registry over explicit sources, tried in order.
    ///
    /// Seeds the snapshot from the cache file when one is configured.
    pub fn with_sources(config: TorConfig, sources: Vec<Box<dyn ExitListSource>>) -> Self {
        let initial = match config.cache_path.as_deref() {
            Some(path) => match load_cache(path) {
                Ok(snapshot) => {
                    info!(
                        exit_nodes = snapshot.len(),
                        path = %path.display(),
                        "Tor exit list restored from cache"
                    );
                    snapshot
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "No usable Tor cache");
                    TorSnapshot::empty()
                }
            },
            None => TorSnapshot::empty(),
        };

        Self {
            config,
            sources,
            snapshot: RwLock::new(Arc::new(initial)),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<TorSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn is_exit_node(&self, ip: &IpAddr) -> bool {
        self.snapshot().contains(ip)
    }

    /// 100 for a known exit, the configured subnet score for a neighbor, else 0.
    pub fn subnet_risk_score(&self, ip: &IpAddr) -> u8 {
        let snapshot = self.snapshot();
        if snapshot.contains(ip) {
            100
        } else if snapshot.subnet_contains(ip) {
            self.config.subnet_score
        } else {
            0
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot().updated_at()
    }

    /// Fetch from the first source that yields a plausible list and swap it in.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<usize, RegistryError> {
        let mut accepted = None;

        for source in &self.sources {
            match source.fetch().await {
                Ok(addresses) => {
                    let snapshot = TorSnapshot::new(addresses, Utc::now());
                    if snapshot.len() >= self.config.min_plausible_entries {
                        accepted = Some(snapshot);
                        break;
                    }
                    let e = RegistryError::Implausible {
                        count: snapshot.len(),
                        min: self.config.min_plausible_entries,
                    };
                    warn!(source = source.name(), error = %e, "Rejecting Tor exit list");
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "Tor exit list fetch failed");
                }
            }
        }

        let snapshot = Arc::new(accepted.ok_or(RegistryError::AllSourcesFailed)?);
        let count = snapshot.len();

        match self.snapshot.write() {
            Ok(mut guard) => *guard = Arc::clone(&snapshot),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&snapshot),
        }

        info!(exit_nodes = count, subnets = snapshot.subnets.len(), "Tor exit node list loaded");

        if let Some(path) = self.config.cache_path.as_deref() {
            if let Err(e) = save_cache(path, &snapshot).await {
                warn!(path = %path.display(), error = %e, "Failed to persist Tor exit list");
            }
        }

        Ok(count)
    }

    /// Refresh now and then on every interval tick until the handle is aborted.
    pub fn spawn_refresh(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.refresh_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!(
                        error = %e,
                        exit_nodes = self.len(),
                        "Tor exit list refresh failed, serving previous snapshot"
                    );
                }
            }
        })
    }
}

fn load_cache(path: &Path) -> Result<TorSnapshot, RegistryError> {
    let content = std::fs::read_to_string(path)?;
    let cache: CacheFile = serde_json::from_str(&content)?;
    Ok(TorSnapshot::new(cache.addresses, cache.updated_at))
}

async fn save_cache(path: &Path, snapshot: &TorSnapshot) -> Result<(), RegistryError> {
    let mut addresses: Vec<IpAddr> = snapshot.addresses.iter().copied().collect();
    addresses.sort();

    let cache = CacheFile {
        updated_at: snapshot.updated_at.unwrap_or_else(Utc::now),
        addresses,
    };
    let body = serde_json::to_vec(&cache)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    // Write then rename so a crash never leaves a truncated cache.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
