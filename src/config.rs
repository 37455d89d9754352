//! Configuration types for the abuse guard.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// Client address extraction from forwarding headers.
    #[serde(default)]
    pub ip_extraction: IpExtractionConfig,

    /// Addresses and networks that always receive a clean verdict.
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Static subnet blocklists. A match forces the score to 100.
    #[serde(default)]
    pub blocklists: Vec<BlocklistConfig>,

    /// Signal providers.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Fusion policy.
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Tor exit registry.
    #[serde(default)]
    pub tor: TorConfig,

    /// Verdict expiry tiers.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Adaptive rate limiter.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Scripted-line detector.
    #[serde(default)]
    pub line_detector: LineDetectorConfig,

    /// Network ownership lookups.
    #[serde(default)]
    pub rdap: RdapConfig,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Score assigned when every provider fails.
    pub unknown_score: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self { unknown_score: 40 }
    }
}

/// IP extraction configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IpExtractionConfig {
    /// Headers to check for the client address, in order of preference.
    pub headers: Vec<String>,

    /// Use the first address from X-Forwarded-For (true) or the last (false).
    pub use_first_ip: bool,
}

impl Default for IpExtractionConfig {
    fn default() -> Self {
        Self {
            headers: strings(&["x-forwarded-for", "x-real-ip", "cf-connecting-ip"]),
            use_first_ip: true,
        }
    }
}

/// File-based subnet blocklist.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlocklistConfig {
    /// Name for logging.
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to blocklist file.
    pub path: PathBuf,

    #[serde(default)]
    pub format: BlocklistFormat,

    /// How often to reload the file from disk (seconds).
    #[serde(default = "default_blocklist_refresh")]
    pub refresh_interval_seconds: u64,
}

fn default_blocklist_refresh() -> u64 {
    300
}

/// Blocklist file format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlocklistFormat {
    /// Plain text, one IP/CIDR per line.
    #[default]
    Plain,
    /// CSV with IP in the first column.
    Csv,
    /// JSON array of IPs.
    Json,
}

/// Signal provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Per-provider call timeout in milliseconds.
    pub timeout_ms: u64,
    pub ip_api: Option<IpApiConfig>,
    pub abuseipdb: Option<AbuseIPDBConfig>,
    pub proxycheck: Option<ProxyCheckConfig>,
    pub getipintel: Option<GetIpIntelConfig>,
    pub reverse_dns: ReverseDnsConfig,
    pub port_probe: PortProbeConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            ip_api: None,
            abuseipdb: None,
            proxycheck: None,
            getipintel: None,
            reverse_dns: ReverseDnsConfig::default(),
            port_probe: PortProbeConfig::default(),
        }
    }
}

impl ProvidersConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// ip-api.com geo/ASN/proxy/hosting lookups.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ip_api_url")]
    pub base_url: String,
}

fn default_ip_api_url() -> String {
    "http://ip-api.com/json".to_string()
}

/// AbuseIPDB abuse-report lookups.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbuseIPDBConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API key (supports ${ENV_VAR} syntax).
    pub api_key: String,

    /// Only consider reports from the last N days.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_max_age_days() -> u32 {
    90
}

/// proxycheck.io proxy/VPN classification.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Optional API key; the free tier works without one.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// getipintel.net proxy probability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GetIpIntelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Contact address required by the service.
    pub contact: String,
}

/// Reverse DNS via DNS-over-HTTPS.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReverseDnsConfig {
    pub enabled: bool,
    pub resolver_url: String,
}

impl Default for ReverseDnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resolver_url: "https://dns.google/resolve".to_string(),
        }
    }
}

/// Second-pass port probing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortProbeConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    /// Per-port connect timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for PortProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![1080, 3128, 8080, 8888, 9050, 9051, 9001, 1194, 1723],
            timeout_ms: 1500,
        }
    }
}

/// Fusion policy: weights, ASN tiers and keyword sets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Lower bound (inclusive) of the band that triggers port probing.
    pub inconclusive_min: u8,
    /// Upper bound (exclusive) of the band that triggers port probing.
    pub inconclusive_max: u8,
    /// Scores below this classify as residential.
    pub residential_below: u8,
    pub weights: Weights,
    pub tor_asns: Vec<u32>,
    pub vpn_asns: Vec<u32>,
    pub proxy_asns: Vec<u32>,
    pub datacenter_asns: Vec<u32>,
    /// Organization/ISP keywords that indicate hosting infrastructure.
    pub infrastructure_keywords: Vec<String>,
    pub rdns_suspicious_keywords: Vec<String>,
    pub rdns_residential_keywords: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            inconclusive_min: 30,
            inconclusive_max: 50,
            residential_below: 50,
            weights: Weights::default(),
            tor_asns: vec![60729, 4224],
            vpn_asns: vec![9009, 212238, 136787, 39351],
            proxy_asns: vec![62240],
            datacenter_asns: vec![16509, 14061, 24940, 16276, 63949, 20473, 8075, 15169, 396982],
            infrastructure_keywords: strings(&[
                "hosting",
                "datacenter",
                "data center",
                "cloud",
                "server",
                "vps",
                "colocation",
                "digitalocean",
                "amazon",
                "hetzner",
                "ovh",
                "linode",
                "vultr",
                "m247",
            ]),
            rdns_suspicious_keywords: strings(&[
                "vpn",
                "proxy",
                "tor",
                "exit",
                "relay",
                "vps",
                "server",
                "host",
                "cloud",
                "dedicated",
                "colo",
                "datacenter",
            ]),
            rdns_residential_keywords: strings(&[
                "dsl",
                "cable",
                "fiber",
                "fibre",
                "dynamic",
                "pool",
                "dhcp",
                "broadband",
                "residential",
                "customer",
                "ftth",
                "mobile",
            ]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Additive weights.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Weights {
    pub proxy: u32,
    pub vpn: u32,
    pub tor: u32,
    pub hosting: u32,
    pub asn_tor: u32,
    pub asn_vpn: u32,
    pub asn_proxy: u32,
    pub asn_datacenter: u32,
    pub infrastructure_org: u32,
    /// Sub-scores at or above this add `sub - 50`.
    pub risk_score_threshold: u8,
    pub risk_score_bonus_cap: u32,
    pub probability_threshold: f64,
    pub probability_multiplier: f64,
    pub abuse_report_threshold: u32,
    pub abuse_report_cap: u32,
    pub rdns_keyword: u32,
    pub no_ptr: u32,
    pub residential_dampener: u32,
    pub open_port: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            proxy: 40,
            vpn: 50,
            tor: 100,
            hosting: 35,
            asn_tor: 100,
            asn_vpn: 80,
            asn_proxy: 60,
            asn_datacenter: 40,
            infrastructure_org: 25,
            risk_score_threshold: 70,
            risk_score_bonus_cap: 50,
            probability_threshold: 0.80,
            probability_multiplier: 40.0,
            abuse_report_threshold: 5,
            abuse_report_cap: 30,
            rdns_keyword: 15,
            no_ptr: 15,
            residential_dampener: 10,
            open_port: 20,
        }
    }
}

/// Tor exit registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TorConfig {
    pub enabled: bool,
    pub primary_url: String,
    pub fallback_url: String,

    /// How often to refresh the exit list (seconds).
    pub refresh_interval_seconds: u64,

    /// Refreshes yielding fewer distinct addresses are rejected as truncated.
    pub min_plausible_entries: usize,

    /// Local cache file read at startup and written after each refresh.
    pub cache_path: Option<PathBuf>,

    /// Score floor for addresses sharing a subnet with an exit.
    pub subnet_score: u8,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_url: "https://check.torproject.org/torbulkexitlist".to_string(),
            fallback_url: "https://www.dan.me.uk/torlist/?exit".to_string(),
            refresh_interval_seconds: 3600,
            min_plausible_entries: 100,
            cache_path: None,
            subnet_score: 60,
        }
    }
}

/// Tiered verdict expiry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Confirmed proxy/VPN/Tor verdicts.
    pub confirmed_ttl_seconds: u64,

    /// Verdicts at or above `risky_score` that are not confirmed.
    pub risky_ttl_seconds: u64,

    pub clean_ttl_seconds: u64,

    /// Placeholder written when a lookup failed.
    pub failure_ttl_seconds: u64,

    /// Scores at or above this count as confirmed.
    pub confirmed_score: u8,

    pub risky_score: u8,

    /// Network ownership records change rarely.
    pub network_ttl_seconds: u64,

    /// Capacity of the built-in memory store.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            confirmed_ttl_seconds: 7 * 24 * 3600,
            risky_ttl_seconds: 24 * 3600,
            clean_ttl_seconds: 6 * 3600,
            failure_ttl_seconds: 600,
            confirmed_score: 75,
            risky_score: 50,
            network_ttl_seconds: 7 * 24 * 3600,
            max_entries: 100_000,
        }
    }
}

/// One quota tier.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct QuotaTier {
    /// Minimum score for this tier.
    pub min_score: u8,
    /// Requests allowed per window.
    pub max_requests: usize,
}

impl QuotaTier {
    const fn new(min_score: u8, max_requests: usize) -> Self {
        Self {
            min_score,
            max_requests,
        }
    }
}

/// Adaptive rate limiter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub normal: QuotaTier,
    pub suspicious: QuotaTier,
    pub high_risk: QuotaTier,
    pub blocked: QuotaTier,

    /// Quota breaches before an origin is hard-blocked.
    pub max_violations: u32,

    pub inactivity_timeout_seconds: u64,

    /// Idle time after which even a hard-blocked record is forgotten.
    pub blocked_retention_seconds: u64,

    pub max_tracked_origins: usize,
    pub cleanup_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            normal: QuotaTier::new(0, 100),
            suspicious: QuotaTier::new(30, 20),
            high_risk: QuotaTier::new(50, 5),
            blocked: QuotaTier::new(75, 0),
            max_violations: 3,
            inactivity_timeout_seconds: 3600,
            blocked_retention_seconds: 24 * 3600,
            max_tracked_origins: 100_000,
            cleanup_interval_seconds: 300,
        }
    }
}

/// Scripted-line detector configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LineDetectorConfig {
    /// Ring buffer capacity per origin.
    pub capacity: usize,
    pub history_window_ms: u64,
    /// Only points this close to the newest one are tested.
    pub burst_window_ms: u64,
    pub min_points: usize,
    pub min_line_length: f64,
    /// Maximum perpendicular deviation in pixels.
    pub collinearity_tolerance: f64,
    pub min_spacing: f64,
    pub max_spacing: f64,
    /// Allowed relative deviation of each spacing from the median.
    pub spacing_tolerance: f64,
    /// Spacings below this count as duplicate points.
    pub degenerate_spacing: f64,
    pub angle_tolerance_degrees: f64,
    pub inactivity_timeout_seconds: u64,
    pub max_tracked_origins: usize,
    /// Risk score reported to the rate limiter on detection.
    pub detection_penalty_score: u8,
    /// Log every detection at info level; otherwise at debug.
    pub log_detections: bool,
}

impl Default for LineDetectorConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            history_window_ms: 60_000,
            burst_window_ms: 15_000,
            min_points: 12,
            min_line_length: 8.0,
            collinearity_tolerance: 0.35,
            min_spacing: 0.75,
            max_spacing: 12.0,
            spacing_tolerance: 0.15,
            degenerate_spacing: 0.5,
            angle_tolerance_degrees: 7.5,
            inactivity_timeout_seconds: 600,
            max_tracked_origins: 100_000,
            detection_penalty_score: 80,
            log_detections: true,
        }
    }
}

/// RDAP network ownership lookups.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RdapConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for RdapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://rdap.org".to_string(),
            timeout_ms: 10_000,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let scoring = &self.scoring;
        if scoring.inconclusive_min >= scoring.inconclusive_max {
            anyhow::bail!(
                "inconclusive_min ({}) must be < inconclusive_max ({})",
                scoring.inconclusive_min,
                scoring.inconclusive_max
            );
        }

        let rl = &self.rate_limit;
        let tiers = [rl.normal, rl.suspicious, rl.high_risk, rl.blocked];
        if tiers.windows(2).any(|w| w[0].min_score >= w[1].min_score) {
            anyhow::bail!("rate limit tier thresholds must be strictly increasing");
        }
        if tiers.windows(2).any(|w| w[0].max_requests < w[1].max_requests) {
            anyhow::bail!("rate limit quotas must not grow with risk");
        }
        if rl.window_seconds == 0 {
            anyhow::bail!("rate_limit.window_seconds must be > 0");
        }
        if rl.max_violations == 0 {
            anyhow::bail!("rate_limit.max_violations must be > 0");
        }

        let ld = &self.line_detector;
        if ld.min_points < 2 || ld.capacity < ld.min_points {
            anyhow::bail!(
                "line_detector.capacity ({}) must be >= min_points ({}) >= 2",
                ld.capacity,
                ld.min_points
            );
        }
        if ld.min_spacing > ld.max_spacing {
            anyhow::bail!("line_detector.min_spacing must be <= max_spacing");
        }

        if let Some(ref abuseipdb) = self.providers.abuseipdb {
            if abuseipdb.enabled && abuseipdb.api_key.is_empty() {
                anyhow::bail!("AbuseIPDB is enabled but api_key is empty");
            }
        }

        if let Some(ref getipintel) = self.providers.getipintel {
            if getipintel.enabled && !getipintel.contact.contains('@') {
                anyhow::bail!("GetIPIntel requires a contact email address");
            }
        }

        for blocklist in &self.blocklists {
            if blocklist.enabled && !blocklist.path.exists() {
                anyhow::bail!(
                    "Blocklist '{}' path does not exist: {}",
                    blocklist.name,
                    blocklist.path.display()
                );
            }
        }

        for entry in &self.allowlist {
            if entry.parse::<IpAddr>().is_err() && entry.parse::<IpNet>().is_err() {
                anyhow::bail!("Invalid allowlist entry: {}", entry);
            }
        }

        Ok(())
    }

    /// Parse allowlist entries into IpAddr or IpNet.
    pub fn parse_allowlist(&self) -> Vec<AllowlistEntry> {
        self.allowlist
            .iter()
            .filter_map(|s| {
                if let Ok(ip) = s.parse::<IpAddr>() {
                    Some(AllowlistEntry::Single(ip))
                } else if let Ok(net) = s.parse::<IpNet>() {
                    Some(AllowlistEntry::Network(net))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Canvas abuse guard configuration

settings:
  unknown_score: 40            # Score when every provider fails

ip_extraction:
  headers:
    - "x-forwarded-for"
    - "x-real-ip"
    - "cf-connecting-ip"
  use_first_ip: true

# Always clean, never scored
allowlist:
  - "127.0.0.1"
  - "10.0.0.0/8"

# Static subnet blocks; a match forces score 100
blocklists:
  - name: "banned-ranges"
    enabled: true
    path: "/etc/canvas-guard/blocked-subnets.txt"
    format: plain              # plain, csv, or json
    refresh_interval_seconds: 300

providers:
  timeout_ms: 10000
  ip_api:
    enabled: true
  abuseipdb:
    enabled: true
    api_key: "${ABUSEIPDB_API_KEY}"
    max_age_days: 90
  proxycheck:
    enabled: true
    api_key: "${PROXYCHECK_API_KEY}"
  getipintel:
    enabled: false
    contact: "abuse@example.com"
  reverse_dns:
    enabled: true
    resolver_url: "https://dns.google/resolve"
  port_probe:
    enabled: true
    ports: [1080, 3128, 8080, 8888, 9050, 9051, 9001, 1194, 1723]
    timeout_ms: 1500

scoring:
  inconclusive_min: 30         # Port probe when 30 <= score < 50
  inconclusive_max: 50
  residential_below: 50

tor:
  enabled: true
  primary_url: "https://check.torproject.org/torbulkexitlist"
  fallback_url: "https://www.dan.me.uk/torlist/?exit"
  refresh_interval_seconds: 3600
  min_plausible_entries: 100
  cache_path: "/var/lib/canvas-guard/tor-exits.json"

cache:
  confirmed_ttl_seconds: 604800
  risky_ttl_seconds: 86400
  clean_ttl_seconds: 21600
  failure_ttl_seconds: 600

rate_limit:
  window_seconds: 60
  normal:     { min_score: 0,  max_requests: 100 }
  suspicious: { min_score: 30, max_requests: 20 }
  high_risk:  { min_score: 50, max_requests: 5 }
  blocked:    { min_score: 75, max_requests: 0 }
  max_violations: 3
  inactivity_timeout_seconds: 3600
  blocked_retention_seconds: 86400   # Idle blocked origins are forgotten after this

line_detector:
  capacity: 64
  min_points: 12
  burst_window_ms: 15000
  collinearity_tolerance: 0.35
  detection_penalty_score: 80
  log_detections: true

rdap:
  enabled: true
  base_url: "https://rdap.org"
"#
        .to_string()
    }
}

/// Parsed allowlist entry.
#[derive(Debug, Clone)]
pub enum AllowlistEntry {
    Single(IpAddr),
    Network(IpNet),
}

impl AllowlistEntry {
    /// Check if an IP address matches this allowlist entry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            AllowlistEntry::Single(allowed) => allowed == ip,
            AllowlistEntry::Network(net) => net.contains(ip),
        }
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(content, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}
