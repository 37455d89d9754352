//! Ensemble risk scoring.
//!
//! A score is computed in up to two passes. The first pass fans out to every
//! enabled provider plus reverse DNS, each under its own timeout, and keeps
//! whatever answered. If that lands in the inconclusive band, a second pass
//! probes well-known proxy ports. Static subnet blocks and the Tor registry
//! are applied last, in that order.

pub mod fusion;

use crate::blocklist::SubnetBlocklist;
use crate::config::{Config, ScoringConfig};
use crate::providers::abuseipdb::AbuseIPDBProvider;
use crate::providers::getipintel::GetIpIntelProvider;
use crate::providers::ip_api::IpApiProvider;
use crate::providers::port_probe::TcpPortProber;
use crate::providers::proxycheck::ProxyCheckProvider;
use crate::providers::reverse_dns::DohReverseDns;
use crate::providers::{PortProber, ReverseDns, Signal, SignalProvider};
use crate::tor::TorRegistry;
use crate::verdict::{Classification, Confidence, RiskVerdict};
use chrono::Utc;
use futures::future::join_all;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use fusion::{classify_hostname, Fusion, HostnameClass, RdnsOutcome};

/// Fans out to providers and fuses their signals.
pub struct EnsembleScorer {
    config: ScoringConfig,
    providers: Vec<Arc<dyn SignalProvider>>,
    reverse_dns: Option<Arc<dyn ReverseDns>>,
    prober: Option<Arc<dyn PortProber>>,
    probe_ports: Vec<u16>,
    probe_timeout: Duration,
    tor: Arc<TorRegistry>,
    blocklist: Arc<SubnetBlocklist>,
    provider_timeout: Duration,
    unknown_score: u8,
    tor_subnet_score: u8,
}

impl EnsembleScorer {
    /// A scorer with no providers; add them with the `with_*` builders.
    pub fn new(config: ScoringConfig, tor: Arc<TorRegistry>, blocklist: Arc<SubnetBlocklist>) -> Self {
        Self {
            config,
            providers: Vec::new(),
            reverse_dns: None,
            prober: None,
            probe_ports: Vec::new(),
            probe_timeout: Duration::from_millis(1500),
            tor,
            blocklist,
            provider_timeout: Duration::from_secs(10),
            unknown_score: 40,
            tor_subnet_score: 60,
        }
    }

    /// Build the scorer and every enabled provider from configuration.
    pub fn from_config(
        config: &Config,
        tor: Arc<TorRegistry>,
        blocklist: Arc<SubnetBlocklist>,
    ) -> anyhow::Result<Self> {
        let providers_config = &config.providers;
        let timeout = providers_config.timeout();

        let mut scorer = Self::new(config.scoring.clone(), tor, blocklist)
            .with_timeout(timeout)
            .with_unknown_score(config.settings.unknown_score)
            .with_tor_subnet_score(config.tor.subnet_score);

        if let Some(ref ip_api) = providers_config.ip_api {
            if ip_api.enabled {
                scorer = scorer.with_provider(Arc::new(IpApiProvider::new(ip_api.clone(), timeout)?));
                info!("ip-api provider enabled");
            }
        }

        if let Some(ref abuseipdb) = providers_config.abuseipdb {
            if abuseipdb.enabled {
                scorer = scorer
                    .with_provider(Arc::new(AbuseIPDBProvider::new(abuseipdb.clone(), timeout)?));
                info!("AbuseIPDB provider enabled");
            }
        }

        if let Some(ref proxycheck) = providers_config.proxycheck {
            if proxycheck.enabled {
                scorer = scorer
                    .with_provider(Arc::new(ProxyCheckProvider::new(proxycheck.clone(), timeout)?));
                info!("proxycheck provider enabled");
            }
        }

        if let Some(ref getipintel) = providers_config.getipintel {
            if getipintel.enabled {
                scorer = scorer
                    .with_provider(Arc::new(GetIpIntelProvider::new(getipintel.clone(), timeout)?));
                info!("GetIPIntel provider enabled");
            }
        }

        if providers_config.reverse_dns.enabled {
            scorer = scorer.with_reverse_dns(Arc::new(DohReverseDns::new(
                providers_config.reverse_dns.clone(),
                timeout,
            )?));
            info!("Reverse DNS enabled");
        }

        let probe = &providers_config.port_probe;
        if probe.enabled && !probe.ports.is_empty() {
            let per_port = Duration::from_millis(probe.timeout_ms);
            scorer = scorer.with_port_prober(
                Arc::new(TcpPortProber::new(per_port)),
                probe.ports.clone(),
                per_port,
            );
            info!(ports = probe.ports.len(), "Port probing enabled");
        }

        info!(providers = scorer.providers.len(), "Ensemble scorer initialized");
        Ok(scorer)
    }

    pub fn with_provider(mut self, provider: Arc<dyn SignalProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_reverse_dns(mut self, reverse_dns: Arc<dyn ReverseDns>) -> Self {
        self.reverse_dns = Some(reverse_dns);
        self
    }

    pub fn with_port_prober(
        mut self,
        prober: Arc<dyn PortProber>,
        ports: Vec<u16>,
        per_port_timeout: Duration,
    ) -> Self {
        self.prober = Some(prober);
        self.probe_ports = ports;
        self.probe_timeout = per_port_timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_unknown_score(mut self, score: u8) -> Self {
        self.unknown_score = score.min(100);
        self
    }

    pub fn with_tor_subnet_score(mut self, score: u8) -> Self {
        self.tor_subnet_score = score.min(100);
        self
    }

    /// Score used when every lookup failed.
    pub fn unknown_score(&self) -> u8 {
        self.unknown_score
    }

    /// Score an address. Never fails; provider errors only reduce confidence.
    pub async fn score(&self, ip: &IpAddr) -> RiskVerdict {
        let ip = ip.to_canonical();
        let ((signals, failures, attempted), rdns) =
            tokio::join!(self.collect_signals(&ip), self.reverse_lookup(&ip));
        self.fuse(&ip, signals, rdns, failures, attempted).await
    }

    /// First-pass fan-out. Provider calls and reverse DNS run concurrently.
    async fn collect_signals(&self, ip: &IpAddr) -> (Vec<Signal>, usize, usize) {
        let enabled: Vec<&Arc<dyn SignalProvider>> =
            self.providers.iter().filter(|p| p.is_enabled()).collect();

        let calls = enabled.iter().map(|provider| async move {
            let outcome = timeout(self.provider_timeout, provider.lookup(ip)).await;
            (provider.name(), outcome)
        });

        let mut signals = Vec::new();
        let mut failures = 0;
        for (name, outcome) in join_all(calls).await {
            match outcome {
                Ok(Ok(signal)) => signals.push(signal),
                Ok(Err(e)) => {
                    warn!(provider = name, ip = %ip, error = %e, "Provider lookup failed");
                    failures += 1;
                }
                Err(_) => {
                    warn!(provider = name, ip = %ip, "Provider lookup timed out");
                    failures += 1;
                }
            }
        }

        (signals, failures, enabled.len())
    }

    async fn reverse_lookup(&self, ip: &IpAddr) -> RdnsOutcome {
        let Some(resolver) = self.reverse_dns.as_ref() else {
            return RdnsOutcome::Disabled;
        };

        match timeout(self.provider_timeout, resolver.reverse(ip)).await {
            Ok(Ok(Some(hostname))) => RdnsOutcome::Hostname(hostname),
            Ok(Ok(None)) => RdnsOutcome::NoPtr,
            Ok(Err(e)) => {
                warn!(ip = %ip, error = %e, "Reverse DNS failed");
                RdnsOutcome::Failed
            }
            Err(_) => {
                warn!(ip = %ip, "Reverse DNS timed out");
                RdnsOutcome::Failed
            }
        }
    }

    async fn fuse(
        &self,
        ip: &IpAddr,
        signals: Vec<Signal>,
        rdns: RdnsOutcome,
        failures: usize,
        attempted: usize,
    ) -> RiskVerdict {
        let rdns_answered = matches!(rdns, RdnsOutcome::Hostname(_) | RdnsOutcome::NoPtr);
        let rdns_failed = rdns == RdnsOutcome::Failed;
        let nothing_answered = signals.is_empty() && !rdns_answered;
        let anything_failed = failures > 0 || rdns_failed;

        let confidence = if nothing_answered && anything_failed {
            Confidence::Unknown
        } else if anything_failed {
            Confidence::Partial
        } else {
            Confidence::Full
        };

        let mut fusion = if confidence == Confidence::Unknown {
            Fusion::with_base(&self.config, self.unknown_score, "lookup_failed")
        } else {
            Fusion::new(&self.config)
        };

        for signal in &signals {
            fusion.fold_signal(signal);
        }
        fusion.fold_rdns(&rdns);

        let first_pass = fusion.score();
        if fusion.is_inconclusive() {
            if let Some(prober) = self.prober.as_ref() {
                let ceiling = self.probe_timeout + Duration::from_millis(500);
                match timeout(ceiling, prober.probe(ip, &self.probe_ports)).await {
                    Ok(open) => fusion.fold_open_ports(&open),
                    Err(_) => warn!(ip = %ip, "Port probe exceeded its ceiling"),
                }
            }
        }

        if let Some(list) = self.blocklist.matching_list(ip) {
            debug!(ip = %ip, blocklist = list, "Address in blocked subnet");
            fusion.raise_to(100, "blocked_subnet");
        }

        let tor_score = self.tor.subnet_risk_score(ip);
        if tor_score >= 100 {
            fusion.raise_to(100, "tor_exit_node");
            fusion.force(Classification::Tor);
        } else if tor_score > 0 {
            fusion.raise_to(tor_score.max(self.tor_subnet_score), "tor_exit_subnet");
        }

        let verdict = RiskVerdict {
            score: fusion.score(),
            classification: fusion.classification(),
            operator: fusion.operator().map(str::to_string),
            asn: fusion.asn(),
            confidence,
            checked_at: Utc::now(),
            expires_at: None,
            flags: fusion.into_flags(),
        };

        debug!(
            ip = %ip,
            first_pass,
            score = verdict.score,
            classification = %verdict.classification,
            flags = ?verdict.flags,
            signals = signals.len(),
            failures,
            attempted,
            "Risk verdict computed"
        );

        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TorConfig;
    use crate::providers::ProviderError;
    use crate::tor::{ExitListSource, RegistryError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Answer(Signal),
        Fail,
        Hang,
    }

    struct MockProvider {
        name: String,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SignalProvider for MockProvider {
        async fn lookup(&self, _ip: &IpAddr) -> Result<Signal, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Answer(signal) => Ok(signal.clone()),
                Behavior::Fail => Err(ProviderError::InvalidResponse("mock".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ProviderError::Timeout)
                }
            }
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn is_enabled(&self) -> bool {
            true
        }
    }

    struct MockDns(Option<String>);

    #[async_trait]
    impl ReverseDns for MockDns {
        async fn reverse(&self, _ip: &IpAddr) -> Result<Option<String>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    struct MockProber {
        open: Vec<u16>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PortProber for MockProber {
        async fn probe(&self, _ip: &IpAddr, ports: &[u16]) -> Vec<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.open.iter().copied().filter(|p| ports.contains(p)).collect()
        }
    }

    struct FixedSource(Vec<IpAddr>);

    #[async_trait]
    impl ExitListSource for FixedSource {
        async fn fetch(&self) -> Result<Vec<IpAddr>, RegistryError> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    async fn registry_with(exits: &[&str]) -> Arc<TorRegistry> {
        let config = TorConfig {
            min_plausible_entries: 1,
            ..TorConfig::default()
        };
        let addresses = exits.iter().map(|s| s.parse().unwrap()).collect();
        let registry = TorRegistry::with_sources(config, vec![Box::new(FixedSource(addresses))]);
        if !exits.is_empty() {
            registry.refresh().await.unwrap();
        }
        Arc::new(registry)
    }

    async fn scorer() -> EnsembleScorer {
        EnsembleScorer::new(
            ScoringConfig::default(),
            registry_with(&["185.220.101.1"]).await,
            Arc::new(SubnetBlocklist::empty()),
        )
        .with_timeout(Duration::from_millis(100))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_clean_residential() {
        let scorer = scorer()
            .await
            .with_provider(MockProvider::new(
                "geo",
                Behavior::Answer(Signal {
                    asn: Some(7922),
                    organization: Some("Comcast Cable".into()),
                    is_proxy: Some(false),
                    is_hosting: Some(false),
                    ..Signal::new("geo")
                }),
            ))
            .with_reverse_dns(Arc::new(MockDns(Some("c-73-1-2-3.hsd1.comcast.net".into()))));

        let verdict = scorer.score(&ip("73.1.2.3")).await;
        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.classification, Classification::Residential);
        assert_eq!(verdict.confidence, Confidence::Full);
        assert_eq!(verdict.asn, Some(7922));
        assert_eq!(verdict.operator.as_deref(), Some("Comcast Cable"));
    }

    #[tokio::test]
    async fn test_vpn_detection() {
        let scorer = scorer().await.with_provider(MockProvider::new(
            "classifier",
            Behavior::Answer(Signal {
                is_vpn: Some(true),
                asn: Some(9009),
                ..Signal::new("classifier")
            }),
        ));

        let verdict = scorer.score(&ip("203.0.113.50")).await;
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.classification, Classification::Vpn);
        assert!(verdict.has_flag("vpn_detected"));
        assert!(verdict.has_flag("vpn_provider_asn"));
    }

    #[tokio::test]
    async fn test_all_providers_fail_yields_unknown() {
        let failing = MockProvider::new("a", Behavior::Fail);
        let hanging = MockProvider::new("b", Behavior::Hang);
        let scorer = scorer()
            .await
            .with_provider(failing.clone())
            .with_provider(hanging.clone());

        let started = std::time::Instant::now();
        let verdict = scorer.score(&ip("198.51.100.7")).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(verdict.confidence, Confidence::Unknown);
        assert_eq!(verdict.score, 40);
        assert!(verdict.has_flag("lookup_failed"));
        assert_eq!(hanging.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successes() {
        let scorer = scorer()
            .await
            .with_provider(MockProvider::new("down", Behavior::Fail))
            .with_provider(MockProvider::new(
                "up",
                Behavior::Answer(Signal {
                    is_proxy: Some(true),
                    ..Signal::new("up")
                }),
            ));

        let verdict = scorer.score(&ip("198.51.100.8")).await;
        assert_eq!(verdict.confidence, Confidence::Partial);
        assert_eq!(verdict.score, 40);
        assert!(verdict.has_flag("proxy_detected"));
        assert!(!verdict.has_flag("lookup_failed"));
    }

    #[tokio::test]
    async fn test_inconclusive_band_triggers_probe() {
        let prober = Arc::new(MockProber {
            open: vec![1080, 9050],
            calls: AtomicUsize::new(0),
        });
        let scorer = scorer()
            .await
            .with_provider(MockProvider::new(
                "geo",
                Behavior::Answer(Signal {
                    is_hosting: Some(true),
                    ..Signal::new("geo")
                }),
            ))
            .with_port_prober(prober.clone(), vec![1080, 3128, 9050], Duration::from_millis(50));

        let verdict = scorer.score(&ip("192.0.2.10")).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
        assert_eq!(verdict.score, 75);
        assert!(verdict.has_flag("open_port:1080"));
        assert!(verdict.has_flag("open_port:9050"));
        assert_eq!(verdict.classification, Classification::Hosting);
    }

    #[tokio::test]
    async fn test_conclusive_score_skips_probe() {
        let prober = Arc::new(MockProber {
            open: vec![1080],
            calls: AtomicUsize::new(0),
        });
        let scorer = scorer()
            .await
            .with_provider(MockProvider::new(
                "geo",
                Behavior::Answer(Signal {
                    is_proxy: Some(false),
                    ..Signal::new("geo")
                }),
            ))
            .with_port_prober(prober.clone(), vec![1080], Duration::from_millis(50));

        let verdict = scorer.score(&ip("192.0.2.11")).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
        assert_eq!(verdict.score, 0);
    }

    #[tokio::test]
    async fn test_tor_exit_override() {
        let scorer = scorer().await.with_provider(MockProvider::new(
            "geo",
            Behavior::Answer(Signal {
                is_hosting: Some(false),
                ..Signal::new("geo")
            }),
        ));

        let verdict = scorer.score(&ip("185.220.101.1")).await;
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.classification, Classification::Tor);
        assert!(verdict.has_flag("tor_exit_node"));

        let neighbor = scorer.score(&ip("185.220.101.77")).await;
        assert_eq!(neighbor.score, 60);
        assert!(neighbor.has_flag("tor_exit_subnet"));
        assert_eq!(neighbor.classification, Classification::Suspicious);
    }

    #[tokio::test]
    async fn test_tor_override_applies_when_providers_fail() {
        let scorer = scorer()
            .await
            .with_provider(MockProvider::new("down", Behavior::Fail));

        let verdict = scorer.score(&ip("185.220.101.1")).await;
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.classification, Classification::Tor);
        assert_eq!(verdict.confidence, Confidence::Unknown);
    }

    #[tokio::test]
    async fn test_blocked_subnet_override() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "45.0.0.0/16").unwrap();
        let blocklist = SubnetBlocklist::load(&[crate::config::BlocklistConfig {
            name: "banned".into(),
            enabled: true,
            path: file.path().to_path_buf(),
            format: crate::config::BlocklistFormat::Plain,
            refresh_interval_seconds: 300,
        }]);

        let scorer = EnsembleScorer::new(
            ScoringConfig::default(),
            registry_with(&[]).await,
            Arc::new(blocklist),
        );

        let verdict = scorer.score(&ip("45.0.3.4")).await;
        assert_eq!(verdict.score, 100);
        assert!(verdict.has_flag("blocked_subnet"));
        assert_eq!(verdict.classification, Classification::Suspicious);
    }

    #[tokio::test]
    async fn test_no_ptr_record() {
        let scorer = scorer().await.with_reverse_dns(Arc::new(MockDns(None)));
        let verdict = scorer.score(&ip("192.0.2.99")).await;
        assert_eq!(verdict.score, 15);
        assert!(verdict.has_flag("no_ptr_record"));
    }

    #[tokio::test]
    async fn test_score_bounded_with_many_signals() {
        let mut scorer = scorer().await;
        for i in 0..10 {
            scorer = scorer.with_provider(MockProvider::new(
                &format!("p{}", i),
                Behavior::Answer(Signal {
                    is_tor: Some(true),
                    is_vpn: Some(true),
                    risk_score: Some(100),
                    abuse_reports: Some(1000),
                    ..Signal::new("p")
                }),
            ));
        }
        let verdict = scorer.score(&ip("192.0.2.200")).await;
        assert_eq!(verdict.score, 100);
    }
}
