//! Periodic cleanup of expired counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::registry::Registry;

/// Spawn a task that sweeps `registry` every `interval`.
///
/// The task runs until it is aborted through the returned handle.
pub fn spawn_cleanup_task(registry: Arc<Registry>, interval: Duration) -> JoinHandle<()> {
    info!(interval_ms = interval.as_millis() as u64, "Starting rate limit cleanup task");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = registry.cleanup();
            debug!(
                objects = registry.len(),
                periods_removed = report.periods_removed,
                cache_cleared = report.cache_cleared,
                "Rate limit cleanup finished"
            );
        }
    })
}
