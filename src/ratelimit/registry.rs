//! Central registry of per-object limiters.
//!
//! The registry owns every [`Limiter`] and is the only place that knows how
//! objects relate to their parents. Checking a parent is a lookup followed by
//! an independent check, so no limiter ever holds another one's lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::limiter::{Admission, CleanupReport, EditOptions, Limiter};
use super::object::{ObjectInfo, ObjectType};
use super::rules::RuleSet;
use crate::config::{NetquotaConfig, ObjectConfig};
use crate::error::{NetquotaError, Rejection, Result};

/// Registry of all limiters, keyed by object.
pub struct Registry {
    limiters: DashMap<ObjectInfo, Arc<Limiter>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty registry whose limiters all use `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            limiters: DashMap::new(),
            clock,
        }
    }

    /// Create a registry holding every object in `config`.
    pub fn from_config(config: &NetquotaConfig) -> Result<Self> {
        let registry = Self::new();
        registry.load(config)?;
        Ok(registry)
    }

    /// Register every object in `config`.
    ///
    /// All rules are parsed before anything is registered. If any object is
    /// malformed or already registered, the objects added so far are removed
    /// again and the registry is left as it was.
    pub fn load(&self, config: &NetquotaConfig) -> Result<()> {
        let limiters = config
            .objects
            .iter()
            .map(|object| self.build_limiter(object))
            .collect::<Result<Vec<_>>>()?;

        let mut inserted = Vec::with_capacity(limiters.len());
        for limiter in limiters {
            let object = limiter.object().clone();
            if let Err(e) = self.insert_new(limiter) {
                for object in &inserted {
                    self.limiters.remove(object);
                }
                warn!(
                    error = %e,
                    rolled_back = inserted.len(),
                    "Rate limiting configuration rejected"
                );
                return Err(e);
            }
            inserted.push(object);
        }

        info!(objects = self.limiters.len(), "Rate limiting configuration loaded");
        Ok(())
    }

    /// Register a new object.
    pub fn create(&self, config: &ObjectConfig) -> Result<()> {
        let limiter = self.build_limiter(config)?;
        self.insert_new(limiter)
    }

    /// Replace an object's rules, carrying its current counters over.
    pub fn edit(&self, object: &ObjectInfo, rules: &str) -> Result<()> {
        self.edit_with(object, rules, EditOptions::default())
    }

    /// Replace an object's rules and, optionally, its other settings.
    ///
    /// The limiter is edited in place under its own lock, so checks racing
    /// with the edit count against the same counters. Malformed rules leave
    /// the limiter untouched.
    pub fn edit_with(
        &self,
        object: &ObjectInfo,
        rules: &str,
        options: EditOptions,
    ) -> Result<()> {
        let rules = RuleSet::parse(rules)?;
        let limiter = self
            .get(object)
            .ok_or_else(|| NetquotaError::ObjectNotFound(object.clone()))?;

        limiter.replace_rules(rules, options);
        info!(object = %object, "Rate limiting rules edited");
        Ok(())
    }

    /// Remove an object and all of its counters.
    ///
    /// Returns whether the object was registered.
    pub fn delete(&self, object: &ObjectInfo) -> bool {
        let removed = self.limiters.remove(object).is_some();
        if removed {
            info!(object = %object, "Rate limiting removed");
        } else {
            debug!(object = %object, "Delete of unknown object ignored");
        }
        removed
    }

    /// Check one request against an object and, if it admits, all of its
    /// ancestors.
    ///
    /// The parent graph must be acyclic.
    pub fn check(
        &self,
        cid: &str,
        object: &ObjectInfo,
        from: &str,
    ) -> std::result::Result<Admission, Rejection> {
        let limiter = self.get(object).ok_or_else(|| {
            warn!(object = %object, cid = %cid, "Rate limit check for unknown object");
            Rejection::ObjectNotFound {
                object: object.clone(),
                cid: cid.to_string(),
            }
        })?;

        let admission = limiter.check(cid, from)?;

        // Inactive limiters report no parent. The parent is checked only
        // after this limiter's lock is released.
        if let Some(parent) = &admission.parent {
            self.check(cid, parent, from)
                .map_err(|source| Rejection::ParentRejected {
                    parent: parent.clone(),
                    source: Box::new(source),
                })?;
        }

        Ok(admission)
    }

    /// [`check`](Self::check) addressed by type and name.
    pub fn check_by_name(
        &self,
        cid: &str,
        object_type: ObjectType,
        object_name: &str,
        from: &str,
    ) -> std::result::Result<Admission, Rejection> {
        self.check(cid, &ObjectInfo::new(object_type, object_name), from)
    }

    /// Sweep every limiter, returning the combined report.
    pub fn cleanup(&self) -> CleanupReport {
        // Collect first so no shard lock is held while limiters are swept.
        let limiters: Vec<Arc<Limiter>> = self
            .limiters
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        limiters
            .iter()
            .map(|limiter| limiter.cleanup())
            .fold(CleanupReport::default(), |acc, report| CleanupReport {
                periods_removed: acc.periods_removed + report.periods_removed,
                cache_cleared: acc.cache_cleared || report.cache_cleared,
            })
    }

    /// The limiter for `object`, if registered.
    pub fn get(&self, object: &ObjectInfo) -> Option<Arc<Limiter>> {
        self.limiters.get(object).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `object` is registered.
    pub fn contains(&self, object: &ObjectInfo) -> bool {
        self.limiters.contains_key(object)
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Keys of all registered objects.
    pub fn objects(&self) -> Vec<ObjectInfo> {
        self.limiters.iter().map(|entry| entry.key().clone()).collect()
    }

    fn build_limiter(&self, config: &ObjectConfig) -> Result<Limiter> {
        let rules = config.rule_set()?;
        Ok(Limiter::new(config.object_info(), rules)
            .with_parent(config.parent.clone())
            .with_mode(config.mode)
            .with_active(config.is_active)
            .with_clock(Arc::clone(&self.clock)))
    }

    fn insert_new(&self, limiter: Limiter) -> Result<()> {
        match self.limiters.entry(limiter.object().clone()) {
            Entry::Occupied(entry) => Err(NetquotaError::ObjectExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!(
                    object = %limiter.object(),
                    parent = ?limiter.parent().map(|p| p.to_string()),
                    mode = ?limiter.mode(),
                    "Rate limiting created"
                );
                entry.insert(Arc::new(limiter));
                Ok(())
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
