//! Statically blocked subnets loaded from files.

use crate::config::{BlocklistConfig, BlocklistFormat};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BlocklistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Entry in a blocklist - either a single IP or a CIDR range.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum BlocklistEntry {
    Single(IpAddr),
    Network(IpNet),
}

impl BlocklistEntry {
    fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            BlocklistEntry::Single(addr) => addr == ip,
            BlocklistEntry::Network(net) => net.contains(ip),
        }
    }
}

/// One file-backed list, reloaded from disk on its own interval.
struct FileList {
    config: BlocklistConfig,
    entries: RwLock<HashSet<BlocklistEntry>>,
    last_refresh: RwLock<Option<Instant>>,
}

impl FileList {
    /// Reload when the interval has passed. Returns whether the file was read.
    fn refresh_if_needed(&self) -> bool {
        let due = match self.last_refresh.read().ok().and_then(|l| *l) {
            Some(instant) => {
                instant.elapsed() > Duration::from_secs(self.config.refresh_interval_seconds)
            }
            None => true,
        };

        if due {
            if let Err(e) = self.refresh() {
                warn!(
                    blocklist = %self.config.name,
                    error = %e,
                    "Failed to reload blocklist, keeping previous entries"
                );
                // Back off until the next interval.
                if let Ok(mut last) = self.last_refresh.write() {
                    *last = Some(Instant::now());
                }
            }
        }
        due
    }

    fn refresh(&self) -> Result<(), BlocklistError> {
        let entries = load_blocklist(&self.config.path, self.config.format)?;
        let count = entries.len();

        if let Ok(mut e) = self.entries.write() {
            *e = entries;
        }
        if let Ok(mut last) = self.last_refresh.write() {
            *last = Some(Instant::now());
        }

        info!(blocklist = %self.config.name, entries = count, "Blocklist loaded");
        Ok(())
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        self.entries
            .read()
            .map(|entries| entries.iter().any(|e| e.contains(ip)))
            .unwrap_or(false)
    }
}

/// Union of all configured subnet blocklists.
pub struct SubnetBlocklist {
    lists: Vec<FileList>,
}

impl SubnetBlocklist {
    /// Load every enabled list. Lists that fail to load are skipped with a warning.
    pub fn load(configs: &[BlocklistConfig]) -> Self {
        let mut lists = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let list = FileList {
                config: config.clone(),
                entries: RwLock::new(HashSet::new()),
                last_refresh: RwLock::new(None),
            };
            match list.refresh() {
                Ok(()) => lists.push(list),
                Err(e) => warn!(
                    blocklist = %config.name,
                    error = %e,
                    "Failed to load blocklist"
                ),
            }
        }
        Self { lists }
    }

    pub fn empty() -> Self {
        Self { lists: Vec::new() }
    }

    /// Name of the first list containing `ip`. Never touches the disk.
    pub fn matching_list(&self, ip: &IpAddr) -> Option<&str> {
        self.lists
            .iter()
            .find_map(|list| list.contains(ip).then_some(list.config.name.as_str()))
    }

    /// Reload every list whose interval has passed. Called from the cleanup
    /// sweep so file reads stay off the lookup path.
    pub fn reload_due(&self) -> usize {
        self.lists
            .iter()
            .filter(|list| list.refresh_if_needed())
            .count()
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.matching_list(ip).is_some()
    }
}

fn load_blocklist(
    path: &Path,
    format: BlocklistFormat,
) -> Result<HashSet<BlocklistEntry>, BlocklistError> {
    let content = std::fs::read_to_string(path)?;

    match format {
        BlocklistFormat::Plain => Ok(load_plain_blocklist(&content)),
        BlocklistFormat::Csv => Ok(load_csv_blocklist(&content)),
        BlocklistFormat::Json => load_json_blocklist(&content),
    }
}

fn content_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// One IP/CIDR per line.
fn load_plain_blocklist(content: &str) -> HashSet<BlocklistEntry> {
    content_lines(content).filter_map(parse_entry).collect()
}

/// First column is the IP/CIDR.
fn load_csv_blocklist(content: &str) -> HashSet<BlocklistEntry> {
    content_lines(content)
        .filter_map(|line| parse_entry(line.split(',').next()?.trim()))
        .collect()
}

/// JSON array of IP/CIDR strings.
fn load_json_blocklist(content: &str) -> Result<HashSet<BlocklistEntry>, BlocklistError> {
    let ips: Vec<String> = serde_json::from_str(content)?;
    Ok(ips.iter().filter_map(|ip| parse_entry(ip.trim())).collect())
}

fn parse_entry(s: &str) -> Option<BlocklistEntry> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(BlocklistEntry::Single(ip));
    }
    s.parse::<IpNet>().ok().map(BlocklistEntry::Network)
}
