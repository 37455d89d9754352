//! Additive fusion of provider signals into one score.

use crate::config::ScoringConfig;
use crate::providers::Signal;
use crate::verdict::Classification;
use std::collections::HashSet;

const MAX_SCORE: u32 = 100;

/// Reverse DNS outcome for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdnsOutcome {
    Hostname(String),
    NoPtr,
    /// Lookup errored or timed out; contributes nothing.
    Failed,
    Disabled,
}

/// Keyword hits for a PTR hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostnameClass {
    pub suspicious: Vec<String>,
    pub residential: bool,
}

/// Match a hostname against suspicious and residential keyword sets.
///
/// Keywords match whole labels or label fragments split on `.` and `-`, so
/// `vps-12.example.net` hits `vps` but `stormhost` does not hit `tor`.
pub fn classify_hostname(hostname: &str, config: &ScoringConfig) -> HostnameClass {
    let lowered = hostname.to_ascii_lowercase();
    let tokens: HashSet<&str> = lowered
        .split(|c: char| c == '.' || c == '-' || c == '_')
        .filter(|t| !t.is_empty())
        .collect();

    let token_hit = |kw: &str| {
        tokens
            .iter()
            .any(|t| *t == kw || (t.starts_with(kw) && t[kw.len()..].chars().all(|c| c.is_ascii_digit())))
    };

    let suspicious = config
        .rdns_suspicious_keywords
        .iter()
        .map(|k| k.to_ascii_lowercase())
        .filter(|k| token_hit(k.as_str()))
        .collect();

    let residential = config
        .rdns_residential_keywords
        .iter()
        .any(|k| token_hit(k.to_ascii_lowercase().as_str()));

    HostnameClass {
        suspicious,
        residential,
    }
}

/// Running fusion state for one address.
#[derive(Debug, Clone)]
pub struct Fusion<'a> {
    config: &'a ScoringConfig,
    score: u32,
    flags: Vec<String>,
    seen_flags: HashSet<String>,
    seen_asns: HashSet<u32>,
    detected: Option<Classification>,
    operator: Option<String>,
    asn: Option<u32>,
}

impl<'a> Fusion<'a> {
    pub fn new(config: &'a ScoringConfig) -> Self {
        Self {
            config,
            score: 0,
            flags: Vec::new(),
            seen_flags: HashSet::new(),
            seen_asns: HashSet::new(),
            detected: None,
            operator: None,
            asn: None,
        }
    }

    /// Start from a fixed base, used when nothing could be looked up.
    pub fn with_base(config: &'a ScoringConfig, base: u8, flag: &str) -> Self {
        let mut fusion = Self::new(config);
        fusion.add(u32::from(base), flag);
        fusion
    }

    /// Add points (running total capped at 100) and record the flag once.
    pub fn add(&mut self, points: u32, flag: &str) {
        self.score = self.score.saturating_add(points).min(MAX_SCORE);
        self.flag(flag);
    }

    fn subtract(&mut self, points: u32, flag: &str) {
        self.score = self.score.saturating_sub(points);
        self.flag(flag);
    }

    fn flag(&mut self, flag: &str) {
        if self.seen_flags.insert(flag.to_string()) {
            self.flags.push(flag.to_string());
        }
    }

    fn detect(&mut self, class: Classification) {
        let more_specific = self
            .detected
            .map_or(true, |current| class.specificity() > current.specificity());
        if more_specific {
            self.detected = Some(class);
        }
    }

    /// Raise the score to at least `floor`.
    pub fn raise_to(&mut self, floor: u8, flag: &str) {
        self.score = self.score.max(u32::from(floor)).min(MAX_SCORE);
        self.flag(flag);
    }

    /// Force a classification regardless of what was detected.
    pub fn force(&mut self, class: Classification) {
        self.detected = Some(class);
    }

    pub fn score(&self) -> u8 {
        self.score.min(MAX_SCORE) as u8
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn operator(&self) -> Option<&str> {
        self.operator.as_deref()
    }

    pub fn asn(&self) -> Option<u32> {
        self.asn
    }

    /// Fold one provider signal.
    pub fn fold_signal(&mut self, signal: &Signal) {
        let config = self.config;
        let w = &config.weights;

        if self.operator.is_none() {
            self.operator = signal.organization.clone().filter(|o| !o.trim().is_empty());
        }

        if signal.is_tor == Some(true) {
            self.add(w.tor, "tor_detected");
            self.detect(Classification::Tor);
        }
        if signal.is_vpn == Some(true) {
            self.add(w.vpn, "vpn_detected");
            self.detect(Classification::Vpn);
        }
        if signal.is_proxy == Some(true) {
            self.add(w.proxy, "proxy_detected");
            self.detect(Classification::Proxy);
        }
        if signal.is_hosting == Some(true) {
            self.add(w.hosting, "hosting_provider");
            self.detect(Classification::Hosting);
        }

        if let Some(asn) = signal.asn {
            self.asn.get_or_insert(asn);
            self.fold_asn(asn);
        }

        if let Some(org) = signal.organization.as_deref() {
            let org = org.to_ascii_lowercase();
            let infra = config
                .infrastructure_keywords
                .iter()
                .any(|k| org.contains(&k.to_ascii_lowercase()));
            if infra {
                self.add(w.infrastructure_org, "infrastructure_org");
                self.detect(Classification::Hosting);
            }
        }

        if let Some(risk) = signal.risk_score {
            if risk >= w.risk_score_threshold {
                let bonus = u32::from(risk.saturating_sub(50)).min(w.risk_score_bonus_cap);
                self.add(bonus, &format!("high_risk_score:{}", risk));
            }
        }

        if let Some(p) = signal.probability {
            if p.is_finite() && p >= w.probability_threshold {
                let bonus = (p.min(1.0) * w.probability_multiplier).floor().max(0.0) as u32;
                self.add(bonus, "high_proxy_probability");
            }
        }

        if let Some(reports) = signal.abuse_reports {
            if reports >= w.abuse_report_threshold {
                let bonus = reports.saturating_mul(2).min(w.abuse_report_cap);
                self.add(bonus, &format!("abuse_reports:{}", reports));
            }
        }

        self.fold_open_ports(&signal.open_ports);
    }

    /// Apply the ASN tier once per distinct ASN.
    fn fold_asn(&mut self, asn: u32) {
        if !self.seen_asns.insert(asn) {
            return;
        }
        let config = self.config;
        let w = &config.weights;
        let tier = if config.tor_asns.contains(&asn) {
            Some((w.asn_tor, "tor_exit_asn", Classification::Tor))
        } else if config.vpn_asns.contains(&asn) {
            Some((w.asn_vpn, "vpn_provider_asn", Classification::Vpn))
        } else if config.proxy_asns.contains(&asn) {
            Some((w.asn_proxy, "proxy_provider_asn", Classification::Proxy))
        } else if config.datacenter_asns.contains(&asn) {
            Some((w.asn_datacenter, "datacenter_asn", Classification::Hosting))
        } else {
            None
        };

        if let Some((points, flag, class)) = tier {
            self.add(points, flag);
            self.detect(class);
        }
    }

    /// Fold the reverse DNS outcome.
    pub fn fold_rdns(&mut self, outcome: &RdnsOutcome) {
        let config = self.config;
        let w = &config.weights;
        match outcome {
            RdnsOutcome::Hostname(host) => {
                let class = classify_hostname(host, config);
                for keyword in &class.suspicious {
                    self.add(w.rdns_keyword, &format!("rdns_keyword:{}", keyword));
                }
                if class.residential && class.suspicious.is_empty() {
                    self.subtract(w.residential_dampener, "rdns_residential");
                }
            }
            RdnsOutcome::NoPtr => self.add(w.no_ptr, "no_ptr_record"),
            RdnsOutcome::Failed | RdnsOutcome::Disabled => {}
        }
    }

    /// Fold ports found open by the probe pass.
    pub fn fold_open_ports(&mut self, ports: &[u16]) {
        let w = self.config.weights.open_port;
        for port in ports {
            let flag = format!("open_port:{}", port);
            if !self.seen_flags.contains(&flag) {
                self.add(w, &flag);
            }
        }
    }

    /// Whether the current score falls in the band that warrants probing.
    pub fn is_inconclusive(&self) -> bool {
        let score = self.score();
        score >= self.config.inconclusive_min && score < self.config.inconclusive_max
    }

    /// Residential below the threshold, else the most specific detected type.
    pub fn classification(&self) -> Classification {
        if self.score() < self.config.residential_below {
            Classification::Residential
        } else {
            self.detected.unwrap_or(Classification::Suspicious)
        }
    }

    pub fn into_flags(self) -> Vec<String> {
        self.flags
    }
}
