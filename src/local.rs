//! In-process fallback counters and the sweeper that bounds them.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{
    config::RateLimitConfig,
    limiter::RateLimitResult,
    metrics::Metrics,
    utils::TimeSource,
};

/// Counter state for one identifier in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u64,
    pub reset_time: i64,
    pub blocked: bool,
}

impl CounterEntry {
    fn new(now: i64, window_millis: i64) -> Self {
        Self {
            count: 0,
            reset_time: now.saturating_add(window_millis),
            blocked: false,
        }
    }

    /// The window has ended
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.reset_time
    }

    /// Count one request against this entry.
    ///
    /// An expired window is rolled over first. A blocked entry stays pinned
    /// at its count until the window ends.
    fn observe(&mut self, config: &RateLimitConfig, now: i64) -> RateLimitResult {
        if self.is_expired(now) {
            *self = CounterEntry::new(now, config.window_millis());
        }

        if !self.blocked {
            self.count = self.count.saturating_add(1);
            self.blocked = self.count > config.limit();
        }

        RateLimitResult::from_count(self.count, config.limit(), self.reset_time)
    }
}

/// Process-local identifier counters.
///
/// Offers no cross-process consistency. Each read-modify-write runs under
/// the map's shard lock.
#[derive(Debug, Default)]
pub struct LocalFallbackStore {
    entries: DashMap<String, CounterEntry>,
}

impl LocalFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request for `identifier` and decide it
    pub fn hit(&self, identifier: &str, config: &RateLimitConfig, now: i64) -> RateLimitResult {
        if let Some(mut entry) = self.entries.get_mut(identifier) {
            return entry.observe(config, now);
        }

        self.entries
            .entry(identifier.to_owned())
            .or_insert_with(|| CounterEntry::new(now, config.window_millis()))
            .observe(config, now)
    }

    pub fn get(&self, identifier: &str) -> Option<CounterEntry> {
        self.entries.get(identifier).map(|entry| *entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry whose window has passed, returning how many went.
    ///
    /// Expiry is checked again under the shard lock at removal, so an entry
    /// refreshed after the scan survives.
    pub fn sweep(&self, time_source: &dyn TimeSource) -> usize {
        let scanned_at = time_source.now_millis();
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(scanned_at))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .iter()
            .filter(|key| {
                self.entries
                    .remove_if(key.as_str(), |_, entry| {
                        entry.is_expired(time_source.now_millis())
                    })
                    .is_some()
            })
            .count()
    }
}

/// Background task running [`LocalFallbackStore::sweep`] on a fixed interval
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweeper on the current tokio runtime
    pub fn spawn(
        store: Arc<LocalFallbackStore>,
        time_source: Arc<dyn TimeSource>,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep(time_source.as_ref());
                        metrics.record_swept_entries(removed);
                        metrics.set_local_entries(store.len());
                        if removed > 0 {
                            debug!(removed, remaining = store.len(), "Swept expired local rate limit entries");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        info!("Local rate limit sweeper started ({}ms interval)", interval.as_millis());
        Self { shutdown, handle }
    }

    /// Signal the task and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
        info!("Local rate limit sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualTimeSource;

    fn config(limit: u64, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig::new(limit, Duration::from_millis(window_ms)).unwrap()
    }

    #[test]
    fn test_first_hit_creates_entry() {
        let store = LocalFallbackStore::new();
        let result = store.hit("user:1", &config(3, 1_000), 10_000);

        assert!(result.allowed);
        assert_eq!(result.count, 1);
        assert_eq!(result.remaining, 2);
        assert_eq!(result.reset_time, 11_000);

        let entry = store.get("user:1").unwrap();
        assert_eq!(entry.count, 1);
        assert!(!entry.blocked);
    }

    #[test]
    fn test_sticky_block_pins_count() {
        let store = LocalFallbackStore::new();
        let cfg = config(2, 1_000);

        assert!(store.hit("ip:10.0.0.1", &cfg, 0).allowed);
        assert!(store.hit("ip:10.0.0.1", &cfg, 1).allowed);

        let denied = store.hit("ip:10.0.0.1", &cfg, 2);
        assert!(!denied.allowed);
        assert!(denied.blocked);
        assert_eq!(denied.count, 3);

        for t in 3..50 {
            let again = store.hit("ip:10.0.0.1", &cfg, t);
            assert!(!again.allowed);
            assert_eq!(again.count, 3);
            assert_eq!(again.remaining, 0);
        }
    }

    #[test]
    fn test_rollover_is_lazy() {
        let store = LocalFallbackStore::new();
        let cfg = config(1, 1_000);

        store.hit("user:9", &cfg, 0);
        assert!(store.hit("user:9", &cfg, 500).blocked);

        // The boundary itself still belongs to the old window
        assert!(store.hit("user:9", &cfg, 1_000).blocked);

        let fresh = store.hit("user:9", &cfg, 1_001);
        assert!(fresh.allowed);
        assert!(!fresh.blocked);
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.reset_time, 2_001);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let clock = ManualTimeSource::new(0);
        let store = LocalFallbackStore::new();

        store.hit("short", &config(5, 100), 0);
        store.hit("long", &config(5, 10_000), 0);
        assert_eq!(store.len(), 2);

        clock.set(50);
        assert_eq!(store.sweep(&clock), 0);

        clock.set(101);
        assert_eq!(store.sweep(&clock), 1);
        assert!(store.get("short").is_none());
        assert!(store.get("long").is_some());
    }

    #[test]
    fn test_sweep_keeps_refreshed_entry() {
        let clock = ManualTimeSource::new(0);
        let store = LocalFallbackStore::new();
        let cfg = config(5, 100);

        store.hit("user:3", &cfg, 0);
        // A new window opened before the sweep reaches the entry
        store.hit("user:3", &cfg, 150);

        clock.set(150);
        assert_eq!(store.sweep(&clock), 0);
        assert_eq!(store.get("user:3").unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_until_stopped() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let store = Arc::new(LocalFallbackStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());

        store.hit("bot:1", &config(5, 100), 0);
        store.hit("bot:2", &config(5, 100), 0);

        let sweeper = Sweeper::spawn(
            store.clone(),
            clock.clone(),
            Duration::from_secs(60),
            metrics.clone(),
        );

        clock.set(1_000);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.is_empty());
        assert_eq!(metrics.swept_entries(), 2);

        sweeper.stop().await;

        // Nothing sweeps after stop
        store.hit("bot:3", &config(5, 100), 1_000);
        clock.set(5_000);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(store.len(), 1);
    }
}
