//! Per-period request counters.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::period::{PeriodKey, TimeUnit};
use super::rules::NetworkPattern;

/// Counters are keyed by the pattern that matched the client.
pub type NetworkKey = NetworkPattern;

/// What is known about one network within one period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    /// Requests admitted so far
    pub requests: u64,
    /// Correlation id of the last admitted request
    pub last_cid: Option<String>,
    /// When the last request was admitted
    pub last_request_time: Option<DateTime<Utc>>,
    /// Client address of the last admitted request
    pub last_from: Option<String>,
    /// Network the last request matched
    pub last_network: Option<NetworkKey>,
}

impl NetworkState {
    /// Count one more request and remember who sent it.
    pub fn record(&mut self, cid: &str, from: &str, network: NetworkKey, now: DateTime<Utc>) {
        self.requests += 1;
        self.last_cid = Some(cid.to_string());
        self.last_request_time = Some(now);
        self.last_from = Some(from.to_string());
        self.last_network = Some(network);
    }
}

/// All counters of one limiter, grouped by period.
#[derive(Debug, Clone, Default)]
pub struct CounterStore {
    by_period: HashMap<PeriodKey, HashMap<NetworkKey, NetworkState>>,
}

impl CounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The state for `network` in `period`, created on first use.
    pub fn entry(&mut self, period: PeriodKey, network: NetworkKey) -> &mut NetworkState {
        self.by_period
            .entry(period)
            .or_default()
            .entry(network)
            .or_default()
    }

    /// The state for `network` in `period`, if any request was seen.
    pub fn get(&self, period: &PeriodKey, network: &NetworkKey) -> Option<&NetworkState> {
        self.by_period.get(period)?.get(network)
    }

    /// Remove every period that ended before the current period of its unit.
    ///
    /// Stale keys are collected first and deleted afterwards. Returns how many
    /// periods were removed.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> usize {
        let current: Vec<PeriodKey> = TimeUnit::ALL.iter().map(|u| u.period_key(now)).collect();

        let to_delete: Vec<PeriodKey> = self
            .by_period
            .keys()
            .filter(|period| current.iter().any(|cur| period.is_before(cur)))
            .cloned()
            .collect();

        for period in &to_delete {
            self.by_period.remove(period);
        }
        to_delete.len()
    }

    /// Number of periods being tracked.
    pub fn period_count(&self) -> usize {
        self.by_period.len()
    }

    /// Whether any period is tracked.
    pub fn is_empty(&self) -> bool {
        self.by_period.is_empty()
    }

    /// Whether counters exist for `period`.
    pub fn contains_period(&self, period: &PeriodKey) -> bool {
        self.by_period.contains_key(period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn net(s: &str) -> NetworkKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_entry_created_with_zero_requests() {
        let mut store = CounterStore::new();
        let period = TimeUnit::Minute.period_key(at(10, 0));

        let state = store.entry(period.clone(), net("10.0.0.0/8"));
        assert_eq!(state.requests, 0);
        assert!(state.last_cid.is_none());
        assert_eq!(store.period_count(), 1);
        assert!(store.contains_period(&period));
    }

    #[test]
    fn test_record_updates_metadata() {
        let mut store = CounterStore::new();
        let now = at(10, 0);
        let period = TimeUnit::Minute.period_key(now);

        store
            .entry(period.clone(), net("10.0.0.0/8"))
            .record("cid-1", "10.0.0.5", net("10.0.0.0/8"), now);
        store
            .entry(period.clone(), net("10.0.0.0/8"))
            .record("cid-2", "10.0.0.6", net("10.0.0.0/8"), now);

        let state = store.get(&period, &net("10.0.0.0/8")).unwrap();
        assert_eq!(state.requests, 2);
        assert_eq!(state.last_cid.as_deref(), Some("cid-2"));
        assert_eq!(state.last_from.as_deref(), Some("10.0.0.6"));
        assert_eq!(state.last_request_time, Some(now));
        assert_eq!(state.last_network, Some(net("10.0.0.0/8")));
    }

    #[test]
    fn test_networks_counted_separately() {
        let mut store = CounterStore::new();
        let now = at(10, 0);
        let period = TimeUnit::Minute.period_key(now);

        store
            .entry(period.clone(), net("10.0.0.0/8"))
            .record("a", "10.0.0.1", net("10.0.0.0/8"), now);
        store
            .entry(period.clone(), NetworkPattern::Any)
            .record("b", "8.8.8.8", NetworkPattern::Any, now);

        assert_eq!(store.get(&period, &net("10.0.0.0/8")).unwrap().requests, 1);
        assert_eq!(store.get(&period, &NetworkPattern::Any).unwrap().requests, 1);
        assert_eq!(store.period_count(), 1);
    }

    #[test]
    fn test_remove_expired_keeps_current_periods() {
        let mut store = CounterStore::new();
        let earlier = at(10, 0);
        let now = earlier + Duration::minutes(5);

        for unit in TimeUnit::ALL {
            store.entry(unit.period_key(earlier), NetworkPattern::Any);
            store.entry(unit.period_key(now), NetworkPattern::Any);
        }
        // minute.10:00, hour.10 and day.2024-03-01 for `earlier`; the hour and
        // day keys are shared with `now`.
        assert_eq!(store.period_count(), 4);

        let removed = store.remove_expired(now);
        assert_eq!(removed, 1);
        for unit in TimeUnit::ALL {
            assert!(store.contains_period(&unit.period_key(now)));
        }
        assert!(!store.contains_period(&TimeUnit::Minute.period_key(earlier)));
    }

    #[test]
    fn test_remove_expired_across_units() {
        let mut store = CounterStore::new();
        let yesterday = at(10, 0) - Duration::days(1);
        let now = at(10, 0);

        for unit in TimeUnit::ALL {
            store.entry(unit.period_key(yesterday), NetworkPattern::Any);
        }
        assert_eq!(store.remove_expired(now), 3);
        assert!(store.is_empty());
    }
}
