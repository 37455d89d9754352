//! Risk-tiered sliding-window rate limiting.
//!
//! Each origin gets a quota chosen by the highest risk score seen for it.
//! Requests beyond the quota are refused and counted as violations; enough
//! violations hard-block the origin until it is explicitly unblocked.

use crate::config::{QuotaTier, RateLimitConfig};
use crate::origin::Origin;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Over quota; retry after the window slides.
    Throttle,
    /// Hard-blocked.
    Deny,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }
}

#[derive(Debug)]
struct RateState {
    requests: VecDeque<Instant>,
    score: u8,
    violations: u32,
    blocked: bool,
    last_seen: Instant,
}

impl RateState {
    fn new(now: Instant) -> Self {
        Self {
            requests: VecDeque::new(),
            score: 0,
            violations: 0,
            blocked: false,
            last_seen: now,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.requests.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-origin adaptive limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    states: DashMap<String, RateState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    /// Quota tier for a score.
    pub fn tier_for(&self, score: u8) -> QuotaTier {
        let c = &self.config;
        [c.blocked, c.high_risk, c.suspicious]
            .into_iter()
            .find(|tier| score >= tier.min_score)
            .unwrap_or(c.normal)
    }

    /// Whether the request may proceed.
    pub fn admit(&self, origin: &Origin, risk_score: u8) -> bool {
        self.check(origin, risk_score).is_allowed()
    }

    pub fn check(&self, origin: &Origin, risk_score: u8) -> Admission {
        self.check_at(origin, risk_score, Instant::now())
    }

    /// Count a request at `now` and decide whether it is admitted.
    pub fn check_at(&self, origin: &Origin, risk_score: u8, now: Instant) -> Admission {
        let key = origin.key();
        if !self.can_track(&key) {
            return self.untracked(origin, risk_score);
        }

        let window = Duration::from_secs(self.config.window_seconds);
        let mut state = self
            .states
            .entry(key)
            .or_insert_with(|| RateState::new(now));

        state.last_seen = now;
        state.score = state.score.max(risk_score.min(100));

        if state.blocked {
            return Admission::Deny;
        }

        state.prune(now, window);
        state.requests.push_back(now);

        let tier = self.tier_for(state.score);
        if state.requests.len() <= tier.max_requests {
            return Admission::Allow;
        }

        state.violations += 1;
        if state.violations >= self.config.max_violations {
            state.blocked = true;
            warn!(
                origin = %origin,
                score = state.score,
                violations = state.violations,
                "Origin hard-blocked after repeated quota breaches"
            );
            Admission::Deny
        } else {
            debug!(
                origin = %origin,
                score = state.score,
                quota = tier.max_requests,
                violations = state.violations,
                "Quota exceeded"
            );
            Admission::Throttle
        }
    }

    /// Decision for an origin the limiter has no room to track: no window is
    /// kept, but a zero-quota tier is still refused.
    fn untracked(&self, origin: &Origin, risk_score: u8) -> Admission {
        if self.tier_for(risk_score.min(100)).max_requests == 0 {
            debug!(origin = %origin, score = risk_score, "Rate limiter full, refusing untracked");
            Admission::Throttle
        } else {
            debug!(origin = %origin, "Rate limiter full, admitting untracked");
            Admission::Allow
        }
    }

    /// Raise the stored risk score for an origin without counting a request.
    pub fn record_request(&self, origin: &Origin, risk_score: u8) {
        self.record_request_at(origin, risk_score, Instant::now());
    }

    fn record_request_at(&self, origin: &Origin, risk_score: u8, now: Instant) {
        let key = origin.key();
        if !self.can_track(&key) {
            return;
        }
        let mut state = self
            .states
            .entry(key)
            .or_insert_with(|| RateState::new(now));
        state.last_seen = now;
        state.score = state.score.max(risk_score.min(100));
    }

    pub fn is_blocked(&self, origin: &Origin) -> bool {
        self.states
            .get(&origin.key())
            .map_or(false, |state| state.blocked)
    }

    /// Lift a hard block and forget past violations. The risk score is kept.
    pub fn unblock(&self, origin: &Origin) {
        if let Some(mut state) = self.states.get_mut(&origin.key()) {
            state.blocked = false;
            state.violations = 0;
            state.requests.clear();
            info!(origin = %origin, "Origin unblocked");
        }
    }

    /// Stored risk score, if the origin is tracked.
    pub fn score(&self, origin: &Origin) -> Option<u8> {
        self.states.get(&origin.key()).map(|state| state.score)
    }

    /// Evict records idle longer than the inactivity timeout. Blocked origins
    /// are kept until idle for the longer blocked retention.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let timeout = Duration::from_secs(self.config.inactivity_timeout_seconds);
        let retention = Duration::from_secs(
            self.config
                .blocked_retention_seconds
                .max(self.config.inactivity_timeout_seconds),
        );
        let before = self.states.len();
        self.states.retain(|_, state| {
            let idle = now.saturating_duration_since(state.last_seen);
            if state.blocked {
                idle < retention
            } else {
                idle < timeout
            }
        });
        let removed = before.saturating_sub(self.states.len());
        if removed > 0 {
            debug!(removed, remaining = self.states.len(), "Rate limiter cleanup");
        }
        removed
    }

    pub fn tracked_origins(&self) -> usize {
        self.states.len()
    }

    fn can_track(&self, key: &str) -> bool {
        self.states.len() < self.config.max_tracked_origins || self.states.contains_key(key)
    }
}
