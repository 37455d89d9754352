//! Reputation lookups with caching and request coalescing.
//!
//! Every query goes to the [`VerdictStore`] first. Misses and expired entries
//! are recomputed once no matter how many callers ask at the same time: the
//! first caller starts a shared future and the rest await it.

use crate::cache::{StoredReputation, VerdictStore};
use crate::config::{AllowlistEntry, CacheConfig};
use crate::origin::Origin;
use crate::scorer::EnsembleScorer;
use crate::verdict::{Confidence, RiskVerdict};
use crate::whois::{NetworkInfo, NetworkLookup};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Result of a reputation query. Parts that were not requested are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reputation {
    pub network: Option<NetworkInfo>,
    pub verdict: Option<RiskVerdict>,
}

type InFlight = Shared<BoxFuture<'static, Reputation>>;

/// Computes and persists reputations.
struct Resolver {
    store: Arc<dyn VerdictStore>,
    scorer: Arc<EnsembleScorer>,
    network: Option<Arc<dyn NetworkLookup>>,
    cache: CacheConfig,
}

impl Resolver {
    async fn resolve(&self, ip: IpAddr, want_network: bool, want_risk: bool) -> Reputation {
        let key = ip.to_string();
        let now = Utc::now();

        let cached = match self.store.get(&key).await {
            Ok(entry) => entry.unwrap_or_default(),
            Err(e) => {
                error!(ip = %ip, error = %e, "Verdict store read failed");
                StoredReputation::default()
            }
        };

        let network = if want_network {
            cached.live_network(now).cloned()
        } else {
            None
        };
        let verdict = if want_risk {
            cached.live_verdict(now).cloned()
        } else {
            None
        };

        let need_network = want_network && network.is_none() && self.network.is_some();
        let need_risk = want_risk && verdict.is_none();

        if !need_network && !need_risk {
            debug!(ip = %ip, "Reputation served from store");
            return Reputation { network, verdict };
        }

        let (fresh_network, fresh_verdict) = tokio::join!(
            async {
                if need_network {
                    self.lookup_network(&ip).await
                } else {
                    None
                }
            },
            async {
                if need_risk {
                    Some(self.stamp(self.scorer.score(&ip).await))
                } else {
                    None
                }
            }
        );

        let entry = StoredReputation {
            verdict: fresh_verdict.clone().or(cached.verdict),
            network: fresh_network.clone().or(cached.network),
            stored_at: None,
        };
        if let Err(e) = self.store.put(&key, entry).await {
            error!(ip = %ip, error = %e, "Failed to persist reputation");
        }

        Reputation {
            network: network.or(fresh_network).filter(|info| !info.is_unresolved()),
            verdict: verdict.or(fresh_verdict),
        }
    }

    /// Ownership record, or a short-lived unresolved placeholder when the
    /// registry fails or has nothing.
    async fn lookup_network(&self, ip: &IpAddr) -> Option<NetworkInfo> {
        let lookup = self.network.as_ref()?;
        let info = match lookup.lookup(ip).await {
            Ok(Some(mut info)) => {
                info.expires_at = expiry(info.fetched_at, self.cache.network_ttl_seconds);
                info
            }
            Ok(None) => {
                debug!(ip = %ip, "No registry record");
                self.unresolved_network()
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "Network lookup failed");
                self.unresolved_network()
            }
        };
        Some(info)
    }

    fn unresolved_network(&self) -> NetworkInfo {
        let mut info = NetworkInfo::unresolved(Utc::now());
        info.expires_at = expiry(info.fetched_at, self.cache.failure_ttl_seconds);
        info
    }

    /// Set the expiry according to the verdict's tier.
    fn stamp(&self, mut verdict: RiskVerdict) -> RiskVerdict {
        let ttl = self.ttl_seconds(&verdict);
        verdict.expires_at = expiry(verdict.checked_at, ttl);
        debug!(
            score = verdict.score,
            classification = %verdict.classification,
            ttl_seconds = ttl,
            "Verdict expiry assigned"
        );
        verdict
    }

    fn ttl_seconds(&self, verdict: &RiskVerdict) -> u64 {
        let cache = &self.cache;
        if verdict.classification.is_confirmed_proxy() || verdict.score >= cache.confirmed_score {
            cache.confirmed_ttl_seconds
        } else if verdict.confidence == Confidence::Unknown {
            cache.failure_ttl_seconds
        } else if verdict.score >= cache.risky_score {
            cache.risky_ttl_seconds
        } else {
            cache.clean_ttl_seconds
        }
    }
}

fn expiry(from: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(Duration::from_secs(seconds))
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
}

/// Front door for reputation queries.
type InFlightKey = (IpAddr, bool, bool);

pub struct ReputationService {
    resolver: Arc<Resolver>,
    allowlist: Vec<AllowlistEntry>,
    in_flight: Arc<DashMap<InFlightKey, InFlight>>,
}

impl ReputationService {
    pub fn new(
        store: Arc<dyn VerdictStore>,
        scorer: Arc<EnsembleScorer>,
        network: Option<Arc<dyn NetworkLookup>>,
        cache: CacheConfig,
    ) -> Self {
        Self {
            resolver: Arc::new(Resolver {
                store,
                scorer,
                network,
                cache,
            }),
            allowlist: Vec::new(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn with_allowlist(mut self, allowlist: Vec<AllowlistEntry>) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn is_allowlisted(&self, ip: &IpAddr) -> bool {
        self.allowlist.iter().any(|entry| entry.contains(ip))
    }

    /// Look up what was asked for, computing it only when the store has nothing fresh.
    pub async fn get_reputation(
        &self,
        origin: &Origin,
        want_network: bool,
        want_risk: bool,
    ) -> Reputation {
        let ip = origin.ip();

        if !want_network && !want_risk {
            return Reputation::default();
        }

        if self.is_allowlisted(&ip) {
            debug!(origin = %origin, "Allowlisted origin");
            return Reputation {
                network: None,
                verdict: want_risk.then(RiskVerdict::clean),
            };
        }

        let key = (ip, want_network, want_risk);
        let (shared, sender) = match self.in_flight.entry(key) {
            Entry::Occupied(entry) => {
                debug!(origin = %origin, "Joining in-flight lookup");
                (entry.get().clone(), None)
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                let future = rx
                    .map(|settled| settled.unwrap_or_default())
                    .boxed()
                    .shared();
                entry.insert(future.clone());
                (future, Some(tx))
            }
        };

        // The lookup runs detached so that it settles and leaves the map even
        // when every waiting caller has been cancelled.
        if let Some(tx) = sender {
            let resolver = Arc::clone(&self.resolver);
            let in_flight = Arc::clone(&self.in_flight);
            tokio::spawn(async move {
                let reputation = resolver.resolve(ip, want_network, want_risk).await;
                in_flight.remove(&key);
                let _ = tx.send(reputation);
            });
        }

        shared.await
    }

    /// Shorthand for the risk verdict alone.
    pub async fn verdict(&self, origin: &Origin) -> RiskVerdict {
        let settled = self.get_reputation(origin, false, true).await;
        settled
            .verdict
            .unwrap_or_else(|| RiskVerdict::unknown(self.resolver.scorer.unknown_score()))
    }

    /// Drop whatever is stored for the origin and compute it again.
    pub async fn refresh(&self, origin: &Origin) -> Reputation {
        let key = origin.ip().to_string();
        if let Err(e) = self.resolver.store.remove(&key).await {
            error!(origin = %origin, error = %e, "Failed to invalidate stored reputation");
        }
        self.get_reputation(origin, true, true).await
    }

    /// Lookups currently being computed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
