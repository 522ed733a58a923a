use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    cache::OverLimitCache,
    config::RateLimitConfig,
    error::{RateLimitError, Result},
    local::{LocalFallbackStore, Sweeper},
    metrics::{Backend, Metrics},
    store::{CounterStore, RemoteStoreSlot},
    utils::{duration_millis, generate_cache_key, is_loopback_identifier, millis_to_datetime, TimeSource},
};

/// Decision for one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests counted in the window, including this one
    pub count: u64,
    pub remaining: u64,
    /// End of the window, epoch milliseconds
    pub reset_time: i64,
    pub blocked: bool,
}

impl RateLimitResult {
    /// Result for a counter value: blocked once `count` exceeds `limit`
    pub fn from_count(count: u64, limit: u64, reset_time: i64) -> Self {
        let blocked = count > limit;
        Self {
            allowed: !blocked,
            count,
            remaining: limit.saturating_sub(count),
            reset_time,
            blocked,
        }
    }

    fn bypass(config: &RateLimitConfig, now: i64) -> Self {
        Self {
            allowed: true,
            count: 0,
            remaining: config.limit(),
            reset_time: now.saturating_add(config.window_millis()),
            blocked: false,
        }
    }

    /// Total quota implied by this result
    pub fn limit(&self) -> u64 {
        self.count.saturating_add(self.remaining)
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.reset_time)
    }
}

/// Engine-wide switches
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Skip all limiting
    pub disabled: bool,
    /// Production deployments never bypass loopback callers
    pub production: bool,
    pub key_prefix: String,
    pub sweep_interval: Duration,
    /// Capacity of the over-limit cache, zero disables it
    pub over_limit_cache_size: u64,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            disabled: false,
            production: false,
            key_prefix: "rl:".to_string(),
            sweep_interval: Duration::from_secs(60),
            over_limit_cache_size: 10_000,
        }
    }
}

/// Fixed-window rate limiter over a shared store with a local fallback.
///
/// `check` never fails: any remote failure degrades to the local store.
pub struct RateLimiter {
    options: LimiterOptions,
    remote: RemoteStoreSlot,
    local: Arc<LocalFallbackStore>,
    over_limit: OverLimitCache,
    time_source: Arc<dyn TimeSource>,
    metrics: Arc<Metrics>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RateLimiter {
    pub fn new(
        options: LimiterOptions,
        remote: RemoteStoreSlot,
        time_source: Arc<dyn TimeSource>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let over_limit = OverLimitCache::new(options.over_limit_cache_size);
        Self {
            options,
            remote,
            local: Arc::new(LocalFallbackStore::new()),
            over_limit,
            time_source,
            metrics,
            sweeper: Mutex::new(None),
        }
    }

    /// Start the local store sweeper; a second call is a no-op
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }

        let mut interval = self.options.sweep_interval;
        if interval.is_zero() {
            interval = LimiterOptions::default().sweep_interval;
            warn!(
                "Zero sweep interval requested, sweeping every {}ms instead",
                interval.as_millis()
            );
        }
        *sweeper = Some(Sweeper::spawn(
            self.local.clone(),
            self.time_source.clone(),
            interval,
            self.metrics.clone(),
        ));
    }

    /// Stop the sweeper and wait for it to exit
    pub async fn stop(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn local_store(&self) -> &LocalFallbackStore {
        &self.local
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Sweep the local store once, outside the periodic schedule
    pub fn sweep_now(&self) -> usize {
        let removed = self.local.sweep(self.time_source.as_ref());
        self.metrics.record_swept_entries(removed);
        self.metrics.set_local_entries(self.local.len());
        removed
    }

    fn should_bypass(&self, identifier: &str) -> bool {
        self.options.disabled || (!self.options.production && is_loopback_identifier(identifier))
    }

    /// Count one request for `identifier` against `config`
    pub async fn check(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let now = self.time_source.now_millis();

        if self.should_bypass(identifier) {
            debug!(identifier, "Rate limiting bypassed");
            self.metrics.record_check(Backend::Bypass, true);
            return RateLimitResult::bypass(config, now);
        }

        match self.remote.get().await {
            Ok(Some(store)) => match self.check_remote(store.as_ref(), identifier, config, now).await {
                Ok(result) => return result,
                Err(e) => {
                    warn!(identifier, error = %e, "Remote rate limit check failed, using local store");
                    self.metrics.record_remote_failure();
                }
            },
            Ok(None) => {}
            Err(RateLimitError::RemoteUnavailable(reason)) => {
                debug!(identifier, reason = %reason, "Remote counter store unavailable, using local store");
                self.metrics.record_remote_failure();
            }
            Err(e) => {
                warn!(identifier, error = %e, "Remote counter store unreachable, using local store");
                self.metrics.record_remote_failure();
            }
        }

        let result = self.local.hit(identifier, config, now);
        self.metrics.record_check(Backend::Local, result.allowed);
        self.metrics.set_local_entries(self.local.len());
        result
    }

    async fn check_remote(
        &self,
        store: &dyn CounterStore,
        identifier: &str,
        config: &RateLimitConfig,
        now: i64,
    ) -> Result<RateLimitResult> {
        // Only a window still over this config's limit may skip the store
        if let Some(window) = self.over_limit.lookup(identifier, now).await {
            if window.count > config.limit() {
                self.metrics.record_over_limit_cache_hit();
                self.metrics.record_check(Backend::OverLimitCache, false);
                return Ok(RateLimitResult::from_count(
                    window.count,
                    config.limit(),
                    window.reset_time,
                ));
            }
        }

        let _timer = self.metrics.start_remote_timer();
        let key = generate_cache_key(&self.options.key_prefix, identifier);

        let count = store.increment(&key).await?;
        if count == 1 {
            store.set_expiry(&key, config.window()).await?;
        }

        let ttl = match store.remaining_ttl(&key).await? {
            Some(ttl) => ttl,
            None => {
                // A key without expiry would never reset
                if count > 1 {
                    warn!(key = %key, "Counter key has no expiry, re-arming window");
                }
                store.set_expiry(&key, config.window()).await?;
                config.window()
            }
        };

        let count = u64::try_from(count).unwrap_or(0);
        let reset_time = now.saturating_add(duration_millis(ttl));
        let result = RateLimitResult::from_count(count, config.limit(), reset_time);

        if result.blocked {
            self.over_limit
                .remember(identifier, result.count, result.reset_time, now)
                .await;
        }

        self.metrics.record_check(Backend::Remote, result.allowed);
        Ok(result)
    }

    /// Health check for the remote store, healthy when none is configured
    pub async fn health_check(&self) -> Result<()> {
        match self.remote.get().await? {
            Some(store) => store.health_check().await,
            None => Ok(()),
        }
    }
}
