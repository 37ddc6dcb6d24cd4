//! Core rate limiter implementation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::counter::{CounterStore, NetworkKey};
use super::matcher::{MatchError, Matched, NetworkMatcher};
use super::object::ObjectInfo;
use super::period::TimeUnit;
use super::rules::{Rate, RuleSet};
use crate::error::{LimitExceeded, Rejection};

/// How strictly counters are kept.
///
/// Both modes count per process. They differ only in name for now: each one
/// drops expired periods through the periodic [`Limiter::cleanup`] sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitMode {
    /// Per-process counters, expired periods removed by a batched sweep
    #[default]
    Approximate,
    /// Reserved for immediate per-period expiry
    Exact,
}

/// Summary of an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// The object that admitted the request
    pub object: ObjectInfo,
    /// The rule that matched, `None` if the limiter is inactive
    pub matched: Option<Matched>,
    /// Requests counted in the current period, including this one
    pub requests: u64,
    /// Parent that must admit the request as well
    pub parent: Option<ObjectInfo>,
}

impl Admission {
    fn inactive(object: ObjectInfo) -> Self {
        Self {
            object,
            matched: None,
            requests: 0,
            parent: None,
        }
    }
}

/// Outcome of one cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Periods removed
    pub periods_removed: usize,
    /// Whether the address cache was emptied
    pub cache_cleared: bool,
}

/// Settings changed by [`Limiter::replace_rules`] besides the rules.
#[derive(Debug, Clone, Default)]
pub struct EditOptions {
    /// Replace the parent; `Some(None)` removes it
    pub parent: Option<Option<ObjectInfo>>,
    /// Replace the limit mode
    pub mode: Option<LimitMode>,
    /// Enable or disable the limiter
    pub is_active: Option<bool>,
}

struct LimiterState {
    matcher: NetworkMatcher,
    counters: CounterStore,
    parent: Option<ObjectInfo>,
    mode: LimitMode,
    is_active: bool,
}

/// Rate limiter for a single protected object.
///
/// All mutable state, settings included, sits behind one lock that every
/// public operation holds for its whole duration. Parent objects are not
/// checked here; the [`Registry`](super::Registry) does that after this
/// limiter's lock has been released.
pub struct Limiter {
    object: ObjectInfo,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Limiter")
            .field("object", &self.object)
            .field("parent", &state.parent)
            .field("mode", &state.mode)
            .field("is_active", &state.is_active)
            .finish()
    }
}

impl Limiter {
    /// Create an active, approximate limiter using the system clock.
    pub fn new(object: ObjectInfo, rules: RuleSet) -> Self {
        debug!(
            object = %object,
            rules = rules.items().len(),
            "Creating rate limiter"
        );

        Self {
            object,
            clock: Arc::new(SystemClock::new()),
            state: Mutex::new(LimiterState {
                matcher: NetworkMatcher::new(rules),
                counters: CounterStore::new(),
                parent: None,
                mode: LimitMode::default(),
                is_active: true,
            }),
        }
    }

    /// Also require the parent object to admit each request.
    pub fn with_parent(mut self, parent: Option<ObjectInfo>) -> Self {
        self.state.get_mut().parent = parent;
        self
    }

    /// Set the limit mode.
    pub fn with_mode(mut self, mode: LimitMode) -> Self {
        self.state.get_mut().mode = mode;
        self
    }

    /// Enable or disable the limiter. Inactive limiters admit everything.
    pub fn with_active(mut self, is_active: bool) -> Self {
        self.state.get_mut().is_active = is_active;
        self
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The object this limiter protects.
    pub fn object(&self) -> &ObjectInfo {
        &self.object
    }

    /// The parent object, if any.
    pub fn parent(&self) -> Option<ObjectInfo> {
        self.state.lock().parent.clone()
    }

    /// The limit mode.
    pub fn mode(&self) -> LimitMode {
        self.state.lock().mode
    }

    /// Whether requests are being checked at all.
    pub fn is_active(&self) -> bool {
        self.state.lock().is_active
    }

    /// The time source.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// A copy of the configured rules.
    pub fn rules(&self) -> RuleSet {
        self.state.lock().matcher.rules().clone()
    }

    /// Swap in new rules, and optionally new settings, keeping all counters.
    ///
    /// Running periods carry on from their current counts. The address cache
    /// starts empty.
    pub fn replace_rules(&self, rules: RuleSet, options: EditOptions) {
        let mut state = self.state.lock();

        state.matcher = NetworkMatcher::new(rules);
        if let Some(parent) = options.parent {
            state.parent = parent;
        }
        if let Some(mode) = options.mode {
            state.mode = mode;
        }
        if let Some(is_active) = options.is_active {
            state.is_active = is_active;
        }

        debug!(
            object = %self.object,
            rules = state.matcher.rules().items().len(),
            periods = state.counters.period_count(),
            "Replaced rate limit rules"
        );
    }

    /// Check, and count, one request from `from`.
    pub fn check(&self, cid: &str, from: &str) -> Result<Admission, Rejection> {
        let mut state = self.state.lock();

        if !state.is_active {
            trace!(object = %self.object, cid = %cid, "Limiter inactive, admitting");
            return Ok(Admission::inactive(self.object.clone()));
        }

        trace!(object = %self.object, from = %from, cid = %cid, "Checking rate limit");

        let matched = match state.matcher.resolve(from) {
            Ok(matched) => matched,
            Err(MatchError::NotPermitted) => {
                debug!(
                    object = %self.object,
                    from = %from,
                    cid = %cid,
                    "Client address not permitted"
                );
                return Err(Rejection::AddressNotPermitted {
                    object: self.object.clone(),
                    from: from.to_string(),
                    cid: cid.to_string(),
                });
            }
            Err(MatchError::InvalidAddress) => {
                debug!(object = %self.object, from = %from, cid = %cid, "Invalid client address");
                return Err(Rejection::InvalidAddress {
                    object: self.object.clone(),
                    from: from.to_string(),
                    cid: cid.to_string(),
                });
            }
        };

        let now = self.clock.now();
        let period = matched.unit.period_key(now);
        let parent = state.parent.clone();
        let current = state.counters.entry(period, matched.network);

        if let Rate::Limited(rate) = matched.rate {
            if current.requests >= rate {
                debug!(
                    object = %self.object,
                    from = %from,
                    network = %matched.network,
                    rate = rate,
                    unit = %matched.unit,
                    cid = %cid,
                    "Rate limit exceeded"
                );
                return Err(Rejection::RateLimitExceeded(Box::new(LimitExceeded {
                    object: self.object.clone(),
                    rate: matched.rate,
                    unit: matched.unit,
                    from: from.to_string(),
                    network: matched.network,
                    cid: cid.to_string(),
                    last_from: current.last_from.clone(),
                    last_request_time: current.last_request_time,
                    last_cid: current.last_cid.clone(),
                })));
            }
        }

        current.record(cid, from, matched.network, now);

        Ok(Admission {
            object: self.object.clone(),
            matched: Some(matched),
            requests: current.requests,
            parent,
        })
    }

    /// Requests counted for `network` in the current `unit` period.
    pub fn current_count(&self, network: &NetworkKey, unit: TimeUnit) -> u64 {
        let period = unit.period_key(self.clock.now());
        let state = self.state.lock();
        state
            .counters
            .get(&period, network)
            .map(|s| s.requests)
            .unwrap_or(0)
    }

    /// Number of periods currently tracked.
    pub fn period_count(&self) -> usize {
        self.state.lock().counters.period_count()
    }

    /// Number of cached client addresses.
    pub fn cached_addresses(&self) -> usize {
        self.state.lock().matcher.cache().len()
    }

    /// Drop counters of periods that are over and trim the address cache.
    pub fn cleanup(&self) -> CleanupReport {
        let mut state = self.state.lock();

        let cache_cleared = state.matcher.cache_mut().clear_if_full();
        let periods_removed = state.counters.remove_expired(self.clock.now());

        if periods_removed > 0 || cache_cleared {
            debug!(
                object = %self.object,
                periods_removed = periods_removed,
                cache_cleared = cache_cleared,
                "Cleaned up rate limiter"
            );
        }

        CleanupReport {
            periods_removed,
            cache_cleared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::object::ObjectType;
    use crate::ratelimit::rules::NetworkPattern;
    use chrono::{Duration, TimeZone, Utc};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 10).unwrap())
    }

    fn limiter(rules: &str, clock: &ManualClock) -> Limiter {
        Limiter::new(
            ObjectInfo::new(ObjectType::Channel, "orders"),
            RuleSet::parse(rules).unwrap(),
        )
        .with_clock(Arc::new(clock.clone()))
    }

    #[test]
    fn test_limiter_creation() {
        let clock = clock();
        let limiter = limiter("* = 5/minute", &clock);
        assert!(limiter.is_active());
        assert_eq!(limiter.mode(), LimitMode::Approximate);
        assert!(limiter.parent().is_none());
        assert_eq!(limiter.period_count(), 0);
    }

    #[test]
    fn test_exactly_rate_requests_admitted() {
        let clock = clock();
        let limiter = limiter("10.0.0.0/8 = 3/minute\n* = 1/minute", &clock);

        for i in 1..=3 {
            let admission = limiter.check(&format!("cid-{}", i), "10.0.0.5").unwrap();
            assert_eq!(admission.requests, i);
        }

        let err = limiter.check("cid-4", "10.0.0.5").unwrap_err();
        match err {
            Rejection::RateLimitExceeded(info) => {
                assert_eq!(info.rate, Rate::Limited(3));
                assert_eq!(info.unit, TimeUnit::Minute);
                assert_eq!(info.from, "10.0.0.5");
                assert_eq!(info.network.to_string(), "10.0.0.0/8");
                assert_eq!(info.cid, "cid-4");
                assert_eq!(info.last_cid.as_deref(), Some("cid-3"));
                assert_eq!(info.last_from.as_deref(), Some("10.0.0.5"));
                assert_eq!(info.last_request_time, Some(clock.now()));
            }
            other => panic!("unexpected rejection: {:?}", other),
        }
    }

    #[test]
    fn test_rejection_does_not_count() {
        let clock = clock();
        let limiter = limiter("* = 1/minute", &clock);

        limiter.check("a", "1.2.3.4").unwrap();
        assert!(limiter.check("b", "1.2.3.4").is_err());
        assert!(limiter.check("c", "1.2.3.4").is_err());
        assert_eq!(limiter.current_count(&NetworkPattern::Any, TimeUnit::Minute), 1);
    }

    #[test]
    fn test_next_period_admits_again() {
        let clock = clock();
        let limiter = limiter("* = 2/minute", &clock);

        limiter.check("a", "1.2.3.4").unwrap();
        limiter.check("b", "1.2.3.4").unwrap();
        assert!(limiter.check("c", "1.2.3.4").is_err());

        clock.advance(Duration::minutes(1));
        assert!(limiter.check("d", "1.2.3.4").is_ok());
    }

    #[test]
    fn test_unlimited_never_rejects_but_counts() {
        let clock = clock();
        let limiter = limiter("127.0.0.1 = unlimited/minute\n* = 1/minute", &clock);

        for i in 0..500 {
            limiter.check(&i.to_string(), "127.0.0.1").unwrap();
        }
        let network: NetworkKey = "127.0.0.1/32".parse().unwrap();
        assert_eq!(limiter.current_count(&network, TimeUnit::Minute), 500);
    }

    #[test]
    fn test_address_not_permitted_on_first_request() {
        let clock = clock();
        let limiter = limiter("10.0.0.0/8 = 100/day", &clock);

        let err = limiter.check("cid", "192.168.1.1").unwrap_err();
        assert!(matches!(
            err,
            Rejection::AddressNotPermitted { ref from, .. } if from == "192.168.1.1"
        ));
        assert_eq!(limiter.period_count(), 0);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let clock = clock();
        let limiter = limiter("10.0.0.0/8 = 100/day\n* = 1/day", &clock);

        let err = limiter.check("cid", "localhost").unwrap_err();
        assert!(matches!(err, Rejection::InvalidAddress { .. }));
    }

    #[test]
    fn test_inactive_limiter_admits_everything() {
        let clock = clock();
        let limiter = limiter("10.0.0.0/8 = 1/day", &clock).with_active(false);

        for _ in 0..10 {
            let admission = limiter.check("cid", "192.168.1.1").unwrap();
            assert!(admission.matched.is_none());
        }
        assert_eq!(limiter.period_count(), 0);
    }

    #[test]
    fn test_cleanup_removes_only_past_periods() {
        let clock = clock();
        let limiter = limiter("10.0.0.0/8 = 10/minute\n* = 10/hour", &clock);

        limiter.check("a", "10.0.0.1").unwrap();
        limiter.check("b", "8.8.8.8").unwrap();
        assert_eq!(limiter.period_count(), 2);

        // Nothing is stale yet.
        assert_eq!(limiter.cleanup().periods_removed, 0);
        assert_eq!(limiter.period_count(), 2);

        clock.advance(Duration::minutes(2));
        limiter.check("c", "10.0.0.1").unwrap();

        let report = limiter.cleanup();
        assert_eq!(report.periods_removed, 1);
        assert!(!report.cache_cleared);
        assert_eq!(limiter.period_count(), 2);
        assert_eq!(limiter.current_count(&NetworkPattern::Any, TimeUnit::Hour), 1);
    }

    #[test]
    fn test_exact_mode_admission_matches_approximate() {
        let clock = clock();
        let limiter = limiter("* = 2/hour", &clock).with_mode(LimitMode::Exact);

        limiter.check("a", "1.1.1.1").unwrap();
        limiter.check("b", "1.1.1.1").unwrap();
        assert!(limiter.check("c", "1.1.1.1").unwrap_err().is_rate_limited());

        clock.advance(Duration::hours(1));
        assert_eq!(limiter.cleanup().periods_removed, 1);
    }

    #[test]
    fn test_cleanup_clears_full_address_cache() {
        let clock = clock();
        let limiter = limiter("0.0.0.0/0 = unlimited/minute\n::/0 = unlimited/minute", &clock);

        for i in 0..1000u32 {
            let addr = std::net::Ipv4Addr::from(0x0a00_0000 + i).to_string();
            limiter.check("cid", &addr).unwrap();
        }
        assert_eq!(limiter.cached_addresses(), 1000);

        let report = limiter.cleanup();
        assert!(report.cache_cleared);
        assert_eq!(limiter.cached_addresses(), 0);
    }

    #[test]
    fn test_hour_rollover_admits_again() {
        let clock = clock();
        let limiter = limiter("* = 1/hour", &clock);

        limiter.check("a", "1.2.3.4").unwrap();
        assert!(limiter.check("b", "1.2.3.4").unwrap_err().is_rate_limited());

        clock.advance(Duration::minutes(59));
        assert!(limiter.check("c", "1.2.3.4").is_err());

        clock.advance(Duration::hours(1));
        assert_eq!(limiter.check("d", "1.2.3.4").unwrap().requests, 1);
    }

    #[test]
    fn test_day_rollover_admits_again() {
        let clock = clock();
        let limiter = limiter("* = 2/day", &clock);

        limiter.check("a", "1.2.3.4").unwrap();
        limiter.check("b", "1.2.3.4").unwrap();
        assert!(limiter.check("c", "1.2.3.4").unwrap_err().is_rate_limited());

        clock.advance(Duration::hours(11));
        assert!(limiter.check("d", "1.2.3.4").is_err());

        clock.advance(Duration::days(1));
        assert_eq!(limiter.check("e", "1.2.3.4").unwrap().requests, 1);
        assert_eq!(limiter.current_count(&NetworkPattern::Any, TimeUnit::Day), 1);
    }

    #[test]
    fn test_replace_rules_keeps_counts() {
        let clock = clock();
        let limiter = limiter("10.0.0.0/8 = 3/minute\n* = 1/minute", &clock);
        limiter.check("a", "10.0.0.5").unwrap();
        limiter.check("b", "10.0.0.5").unwrap();

        limiter.replace_rules(
            RuleSet::parse("10.0.0.0/8 = 3/minute\n* = 5/minute").unwrap(),
            EditOptions::default(),
        );

        limiter.check("c", "10.0.0.5").unwrap();
        assert!(limiter.check("d", "10.0.0.5").is_err());
        assert_eq!(limiter.cached_addresses(), 1);
    }

    #[test]
    fn test_replace_rules_applies_options() {
        let clock = clock();
        let limiter = limiter("* = 1/minute", &clock);
        let parent = ObjectInfo::new(ObjectType::SecurityDefinition, "partner");

        limiter.replace_rules(
            RuleSet::parse("* = 1/minute").unwrap(),
            EditOptions {
                parent: Some(Some(parent.clone())),
                mode: Some(LimitMode::Exact),
                is_active: None,
            },
        );
        assert_eq!(limiter.parent(), Some(parent.clone()));
        assert_eq!(limiter.mode(), LimitMode::Exact);
        assert!(limiter.is_active());
        assert_eq!(limiter.check("a", "1.2.3.4").unwrap().parent, Some(parent));

        limiter.replace_rules(
            RuleSet::parse("* = 1/minute").unwrap(),
            EditOptions {
                parent: Some(None),
                is_active: Some(false),
                ..Default::default()
            },
        );
        let admission = limiter.check("b", "1.2.3.4").unwrap();
        assert!(admission.parent.is_none());
        assert!(admission.matched.is_none());
        assert_eq!(limiter.current_count(&NetworkPattern::Any, TimeUnit::Minute), 1);
    }
}
