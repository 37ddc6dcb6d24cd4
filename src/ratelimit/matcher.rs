//! Resolution of client addresses to rules.

use std::collections::HashMap;
use std::net::IpAddr;
use tracing::trace;

use super::period::TimeUnit;
use super::rules::{NetworkPattern, Rate, RuleSet};

/// Maximum number of resolved addresses kept per limiter.
pub const ADDRESS_CACHE_CAPACITY: usize = 1000;

/// Cache of parsed client addresses.
///
/// Once the cache is full it is emptied in one go; there is no per-entry
/// eviction.
#[derive(Debug)]
pub struct AddressCache {
    entries: HashMap<String, IpAddr>,
    capacity: usize,
}

impl AddressCache {
    /// Create a cache holding at most `capacity` addresses.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Parse `from`, reusing an earlier result when there is one.
    ///
    /// Returns `None` if `from` is not an IP address. Unparseable input is
    /// never cached.
    pub fn resolve(&mut self, from: &str) -> Option<IpAddr> {
        if let Some(addr) = self.entries.get(from) {
            return Some(*addr);
        }

        let addr: IpAddr = from.trim().parse().ok()?;
        if self.entries.len() >= self.capacity {
            trace!(size = self.entries.len(), "Address cache full, clearing");
            self.entries.clear();
        }
        self.entries.insert(from.to_string(), addr);
        Some(addr)
    }

    /// Clear the cache if it has reached capacity.
    ///
    /// Returns whether it was cleared.
    pub fn clear_if_full(&mut self) -> bool {
        if self.entries.len() >= self.capacity {
            self.entries.clear();
            true
        } else {
            false
        }
    }

    /// Number of cached addresses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::with_capacity(ADDRESS_CACHE_CAPACITY)
    }
}

/// The rule a client address resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matched {
    pub network: NetworkPattern,
    pub rate: Rate,
    pub unit: TimeUnit,
}

/// Why an address could not be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    /// The address did not parse
    InvalidAddress,
    /// No rule covers the address
    NotPermitted,
}

/// Finds the rule that applies to a client address.
#[derive(Debug)]
pub struct NetworkMatcher {
    rules: RuleSet,
    cache: AddressCache,
}

impl NetworkMatcher {
    /// Create a matcher over `rules`.
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            cache: AddressCache::default(),
        }
    }

    /// The rules being matched against.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Resolve `from` to the first rule that covers it.
    ///
    /// The from-any shortcut, when set, applies to every client without
    /// looking at the address at all.
    pub fn resolve(&mut self, from: &str) -> Result<Matched, MatchError> {
        if let Some(spec) = self.rules.from_any_spec() {
            return Ok(Matched {
                network: NetworkPattern::Any,
                rate: spec.rate,
                unit: spec.unit,
            });
        }

        let addr = self.cache.resolve(from).ok_or(MatchError::InvalidAddress)?;
        self.rules
            .find(&addr)
            .map(|item| Matched {
                network: item.network,
                rate: item.rate,
                unit: item.unit,
            })
            .ok_or(MatchError::NotPermitted)
    }

    /// Access to the address cache, used by cleanup.
    pub fn cache_mut(&mut self) -> &mut AddressCache {
        &mut self.cache
    }

    /// Read-only access to the address cache.
    pub fn cache(&self) -> &AddressCache {
        &self.cache
    }
}
