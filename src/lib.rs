//! Abuse detection for a public shared canvas.
//!
//! Separates people from automation in real time: scores client addresses
//! for proxy, VPN, Tor and hosting use, throttles requests by that risk, and
//! flags placement sequences that trace machine-perfect straight lines.
//! Decisions about bans are left to the caller.
//!
//! # Features
//!
//! - **Ensemble scoring** - Concurrent lookups against ip-api, AbuseIPDB,
//!   proxycheck and GetIPIntel, plus reverse DNS and an optional port probe
//! - **Tor exit registry** - Periodically refreshed exit list with subnet
//!   matching and an on-disk cache
//! - **Reputation cache** - Tiered expiry and coalescing of concurrent lookups
//! - **Adaptive rate limiting** - Quotas that shrink as risk grows, with hard
//!   blocks after repeated breaches
//! - **Scripted-line detection** - Geometric test over recent placements
//!
//! # Example Configuration
//!
//! ```yaml
//! providers:
//!   abuseipdb:
//!     enabled: true
//!     api_key: "${ABUSEIPDB_API_KEY}"
//!
//! tor:
//!   cache_path: "/var/lib/canvas-guard/tor-exits.json"
//!
//! rate_limit:
//!   high_risk: { min_score: 50, max_requests: 5 }
//!
//! allowlist:
//!   - "127.0.0.1"
//!   - "10.0.0.0/8"
//! ```

pub mod blocklist;
pub mod cache;
pub mod config;
pub mod guard;
pub mod line_detector;
pub mod orchestrator;
pub mod origin;
pub mod providers;
pub mod rate_limit;
pub mod scorer;
pub mod tor;
pub mod verdict;
pub mod whois;

pub use config::Config;
pub use guard::{BackgroundTasks, Guard, GuardStats};
pub use line_detector::{detect_line, LineDetection, LineDetector, LineDirection, Placement};
pub use orchestrator::{Reputation, ReputationService};
pub use origin::{Origin, OriginError};
pub use rate_limit::{Admission, RateLimiter};
pub use scorer::EnsembleScorer;
pub use tor::TorRegistry;
pub use verdict::{Classification, Confidence, RiskVerdict};
