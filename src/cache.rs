use moka::{future::Cache, Expiry};
use std::time::{Duration, Instant};

/// A window in which an identifier is known to be over its remote limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedWindow {
    pub count: u64,
    pub reset_time: i64,
    ttl: Duration,
}

struct WindowExpiry;

impl Expiry<String, BlockedWindow> for WindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &BlockedWindow,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Local memo of identifiers already blocked in the shared store.
///
/// Lets repeat offenders be denied without a remote round trip. The moka
/// expiry only bounds memory; validity is decided against the limiter's
/// clock on every lookup.
pub struct OverLimitCache {
    cache: Option<Cache<String, BlockedWindow>>,
}

impl OverLimitCache {
    /// Create a cache holding at most `capacity` identifiers; zero disables it
    pub fn new(capacity: u64) -> Self {
        let cache = (capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .expire_after(WindowExpiry)
                .build()
        });
        Self { cache }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Blocked window for `identifier` still in force at `now`
    pub async fn lookup(&self, identifier: &str, now: i64) -> Option<BlockedWindow> {
        let cache = self.cache.as_ref()?;
        let window = cache.get(identifier).await?;
        if now > window.reset_time {
            cache.invalidate(identifier).await;
            return None;
        }
        Some(window)
    }

    /// Remember that `identifier` is blocked until `reset_time`
    pub async fn remember(&self, identifier: &str, count: u64, reset_time: i64, now: i64) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let Ok(ttl_millis) = u64::try_from(reset_time.saturating_sub(now)) else {
            return;
        };
        if ttl_millis == 0 {
            return;
        }

        let window = BlockedWindow {
            count,
            reset_time,
            ttl: Duration::from_millis(ttl_millis),
        };
        cache.insert(identifier.to_owned(), window).await;
    }
}
