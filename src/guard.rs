//! Wiring of the abuse-detection services behind one handle.

use crate::blocklist::SubnetBlocklist;
use crate::cache::{MemoryVerdictStore, VerdictStore};
use crate::config::Config;
use crate::line_detector::{LineDetection, LineDetector};
use crate::orchestrator::{Reputation, ReputationService};
use crate::origin::Origin;
use crate::rate_limit::{Admission, RateLimiter};
use crate::scorer::EnsembleScorer;
use crate::tor::TorRegistry;
use crate::verdict::RiskVerdict;
use crate::whois::{NetworkLookup, RdapLookup};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Point-in-time counters for operators.
#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    pub rate_limited_origins: usize,
    pub placement_histories: usize,
    pub in_flight_lookups: usize,
    pub tor_exit_nodes: usize,
    pub tor_updated_at: Option<DateTime<Utc>>,
    pub stored_reputations: Option<usize>,
}

/// Owns the periodic tasks. Dropping it stops them.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every task now. Consuming the handle runs `Drop`, which aborts them.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Reputation, admission and placement checks for one deployment.
pub struct Guard {
    reputation: Arc<ReputationService>,
    limiter: Arc<RateLimiter>,
    detector: Arc<LineDetector>,
    tor: Arc<TorRegistry>,
    blocklist: Option<Arc<SubnetBlocklist>>,
    memory_store: Option<Arc<MemoryVerdictStore>>,
    tor_refresh: bool,
    cleanup_interval: Duration,
    placement_penalty: u8,
}

impl Guard {
    /// Assemble from explicitly constructed services.
    pub fn new(
        reputation: Arc<ReputationService>,
        limiter: Arc<RateLimiter>,
        detector: Arc<LineDetector>,
        tor: Arc<TorRegistry>,
    ) -> Self {
        let placement_penalty = detector.config().detection_penalty_score;
        Self {
            reputation,
            limiter,
            detector,
            tor,
            blocklist: None,
            memory_store: None,
            tor_refresh: false,
            cleanup_interval: Duration::from_secs(300),
            placement_penalty,
        }
    }

    /// Build every service from configuration with the built-in memory store.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryVerdictStore::new(config.cache.max_entries));
        let mut guard = Self::with_store(config, store.clone())?;
        guard.memory_store = Some(store);
        Ok(guard)
    }

    /// Build from configuration over a caller-supplied verdict store.
    pub fn with_store(config: &Config, store: Arc<dyn VerdictStore>) -> anyhow::Result<Self> {
        let tor = Arc::new(TorRegistry::new(config.tor.clone())?);
        if !config.tor.enabled {
            info!("Tor exit registry disabled");
        }

        let blocklist = Arc::new(SubnetBlocklist::load(&config.blocklists));
        let scorer = Arc::new(EnsembleScorer::from_config(
            config,
            tor.clone(),
            Arc::clone(&blocklist),
        )?);

        let network: Option<Arc<dyn NetworkLookup>> = if config.rdap.enabled {
            let lookup = RdapLookup::new(
                &config.rdap.base_url,
                Duration::from_millis(config.rdap.timeout_ms),
            )?;
            info!(base_url = %config.rdap.base_url, "RDAP network lookups enabled");
            Some(Arc::new(lookup))
        } else {
            None
        };

        let reputation = ReputationService::new(store, scorer, network, config.cache.clone())
            .with_allowlist(config.parse_allowlist());

        let mut guard = Self::new(
            Arc::new(reputation),
            Arc::new(RateLimiter::new(config.rate_limit.clone())),
            Arc::new(LineDetector::new(config.line_detector.clone())),
            tor,
        );
        guard.blocklist = Some(blocklist);
        guard.tor_refresh = config.tor.enabled;
        guard.cleanup_interval = Duration::from_secs(config.rate_limit.cleanup_interval_seconds.max(1));

        info!(
            allowlist = config.allowlist.len(),
            blocklists = config.blocklists.len(),
            "Guard initialized"
        );
        Ok(guard)
    }

    /// Risk verdict for an origin.
    pub async fn reputation(&self, origin: &Origin) -> RiskVerdict {
        self.reputation.verdict(origin).await
    }

    pub async fn get_reputation(
        &self,
        origin: &Origin,
        want_network: bool,
        want_risk: bool,
    ) -> Reputation {
        self.reputation
            .get_reputation(origin, want_network, want_risk)
            .await
    }

    /// Recompute an origin's reputation, ignoring what is stored.
    pub async fn refresh(&self, origin: &Origin) -> Reputation {
        self.reputation.refresh(origin).await
    }

    /// Decide whether a request from `origin` proceeds, based on its current risk.
    pub async fn admit(&self, origin: &Origin) -> Admission {
        if self.limiter.is_blocked(origin) {
            return Admission::Deny;
        }
        let verdict = self.reputation(origin).await;
        let admission = self.limiter.check(origin, verdict.score);
        debug!(
            origin = %origin,
            score = verdict.score,
            admission = ?admission,
            "Admission decided"
        );
        admission
    }

    /// Record a placement. A detected scripted line raises the origin's rate-limit tier.
    pub fn record_placement(
        &self,
        origin: &Origin,
        x: f64,
        y: f64,
        color: u32,
        timestamp_ms: u64,
    ) -> LineDetection {
        let detection = self.detector.record_event(origin, x, y, color, timestamp_ms);
        if detection.is_detected() {
            self.limiter.record_request(origin, self.placement_penalty);
        }
        detection
    }

    pub fn is_blocked(&self, origin: &Origin) -> bool {
        self.limiter.is_blocked(origin)
    }

    pub fn unblock(&self, origin: &Origin) {
        self.limiter.unblock(origin);
    }

    pub fn tor(&self) -> &Arc<TorRegistry> {
        &self.tor
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn detector(&self) -> &Arc<LineDetector> {
        &self.detector
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            rate_limited_origins: self.limiter.tracked_origins(),
            placement_histories: self.detector.tracked_origins(),
            in_flight_lookups: self.reputation.in_flight(),
            tor_exit_nodes: self.tor.len(),
            tor_updated_at: self.tor.updated_at(),
            stored_reputations: self.memory_store.as_ref().map(|store| store.len()),
        }
    }

    /// Start the Tor refresh loop and the cleanup sweep, which also reloads
    /// blocklists that are due.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let mut handles = Vec::new();

        if self.tor_refresh {
            handles.push(Arc::clone(&self.tor).spawn_refresh());
        }

        let limiter = Arc::clone(&self.limiter);
        let detector = Arc::clone(&self.detector);
        let store = self.memory_store.clone();
        let blocklist = self.blocklist.clone();
        let period = self.cleanup_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let rate = limiter.cleanup();
                let placements = detector.cleanup();
                let stored = store.as_ref().map_or(0, |s| s.cleanup());
                let reloaded = blocklist.as_ref().map_or(0, |b| b.reload_due());
                debug!(rate, placements, stored, reloaded, "Cleanup sweep finished");
            }
        }));

        BackgroundTasks { handles }
    }
}
