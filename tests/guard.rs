use async_trait::async_trait;
use canvas_abuse_guard::blocklist::SubnetBlocklist;
use canvas_abuse_guard::cache::MemoryVerdictStore;
use canvas_abuse_guard::config::{
    CacheConfig, LineDetectorConfig, RateLimitConfig, ScoringConfig, TorConfig,
};
use canvas_abuse_guard::providers::{ProviderError, Signal, SignalProvider};
use canvas_abuse_guard::tor::{ExitListSource, RegistryError};
use canvas_abuse_guard::{
    Admission, Classification, EnsembleScorer, Guard, LineDetector, Origin, RateLimiter,
    ReputationService, TorRegistry,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers from a fixed table; unknown addresses look like home broadband.
struct TableProvider {
    table: HashMap<IpAddr, Signal>,
    calls: AtomicUsize,
}

#[async_trait]
impl SignalProvider for TableProvider {
    async fn lookup(&self, ip: &IpAddr) -> Result<Signal, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.table.get(ip).cloned().unwrap_or_else(|| Signal {
            is_proxy: Some(false),
            is_hosting: Some(false),
            organization: Some("Example Broadband".into()),
            ..Signal::new("table")
        }))
    }

    fn name(&self) -> &str {
        "table"
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

struct ExitList(Vec<IpAddr>);

#[async_trait]
impl ExitListSource for ExitList {
    async fn fetch(&self) -> Result<Vec<IpAddr>, RegistryError> {
        Ok(self.0.clone())
    }

    fn name(&self) -> &str {
        "exit-list"
    }
}

async fn guard() -> (Guard, Arc<TableProvider>) {
    let mut table = HashMap::new();
    table.insert(
        "203.0.113.9".parse().unwrap(),
        Signal {
            is_vpn: Some(true),
            asn: Some(9009),
            organization: Some("M247 Ltd".into()),
            ..Signal::new("table")
        },
    );
    let provider = Arc::new(TableProvider {
        table,
        calls: AtomicUsize::new(0),
    });

    let tor = Arc::new(TorRegistry::with_sources(
        TorConfig {
            min_plausible_entries: 1,
            ..TorConfig::default()
        },
        vec![Box::new(ExitList(vec!["185.220.101.1".parse().unwrap()]))],
    ));
    tor.refresh().await.unwrap();

    let scorer = EnsembleScorer::new(
        ScoringConfig::default(),
        tor.clone(),
        Arc::new(SubnetBlocklist::empty()),
    )
    .with_provider(provider.clone())
    .with_timeout(Duration::from_secs(1));

    let reputation = ReputationService::new(
        Arc::new(MemoryVerdictStore::new(1000)),
        Arc::new(scorer),
        None,
        CacheConfig::default(),
    );

    let guard = Guard::new(
        Arc::new(reputation),
        Arc::new(RateLimiter::new(RateLimitConfig::default())),
        Arc::new(LineDetector::new(LineDetectorConfig::default())),
        tor,
    );
    (guard, provider)
}

#[tokio::test]
async fn residential_origin_is_admitted() {
    let (guard, provider) = guard().await;
    let origin = Origin::parse("198.51.100.20").unwrap();

    for _ in 0..10 {
        assert_eq!(guard.admit(&origin).await, Admission::Allow);
    }

    let verdict = guard.reputation(&origin).await;
    assert_eq!(verdict.classification, Classification::Residential);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tor_exit_is_refused() {
    let (guard, _) = guard().await;
    let origin = Origin::parse("185.220.101.1").unwrap();

    let verdict = guard.reputation(&origin).await;
    assert_eq!(verdict.score, 100);
    assert_eq!(verdict.classification, Classification::Tor);

    assert_eq!(guard.admit(&origin).await, Admission::Throttle);
    assert_eq!(guard.admit(&origin).await, Admission::Throttle);
    assert_eq!(guard.admit(&origin).await, Admission::Deny);
    assert!(guard.is_blocked(&origin));

    guard.unblock(&origin);
    assert!(!guard.is_blocked(&origin));
}

#[tokio::test]
async fn vpn_origin_gets_confirmed_verdict() {
    let (guard, _) = guard().await;
    let origin = Origin::parse("203.0.113.9").unwrap();

    let verdict = guard.reputation(&origin).await;
    assert_eq!(verdict.classification, Classification::Vpn);
    assert!(verdict.has_flag("vpn_provider_asn"));
    assert_eq!(verdict.operator.as_deref(), Some("M247 Ltd"));
    assert!(!guard.admit(&origin).await.is_allowed());
}

#[tokio::test]
async fn scripted_line_tightens_quota() {
    let (guard, _) = guard().await;
    let origin = Origin::parse("198.51.100.30").unwrap().with_user("painter");

    let mut detected = false;
    for i in 0..15u64 {
        let detection = guard.record_placement(&origin, 200.0 + i as f64, 40.0, 7, 10_000 + i * 80);
        detected |= detection.is_detected();
    }
    assert!(detected);
    assert_eq!(guard.limiter().score(&origin), Some(80));

    // Penalty score lands in the zero-quota tier.
    assert!(!guard.admit(&origin).await.is_allowed());

    // Another user on the same address is unaffected.
    let neighbor = Origin::parse("198.51.100.30").unwrap().with_user("someone-else");
    assert!(guard.admit(&neighbor).await.is_allowed());
}

#[tokio::test]
async fn stats_reflect_activity() {
    let (guard, _) = guard().await;
    let origin = Origin::parse("198.51.100.40").unwrap();

    guard.admit(&origin).await;
    guard.record_placement(&origin, 1.0, 2.0, 3, 0);

    let stats = guard.stats();
    assert_eq!(stats.rate_limited_origins, 1);
    assert_eq!(stats.placement_histories, 1);
    assert_eq!(stats.tor_exit_nodes, 1);
    assert!(stats.tor_updated_at.is_some());
    assert_eq!(stats.in_flight_lookups, 0);
}

#[tokio::test]
async fn background_tasks_stop_on_drop() {
    let (guard, _) = guard().await;
    let tasks = guard.spawn_background();
    assert_eq!(tasks.len(), 1);
    drop(tasks);
}

#[tokio::test]
async fn background_tasks_shut_down_explicitly() {
    let (guard, _) = guard().await;
    let tasks = guard.spawn_background();
    assert!(!tasks.is_empty());
    tasks.shutdown();
    assert_eq!(guard.stats().in_flight_lookups, 0);
}
