//! Shared counter store contract and its lazily constructed slot.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{
    error::{RateLimitError, Result},
    utils::{duration_millis, TimeSource},
};

/// Atomic counter primitive shared by every server process.
///
/// `increment` must be atomic across all callers of the same key, whichever
/// process issues it.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the key by one and return the new value
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Set the key's time-to-live
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remaining time-to-live, `None` when the key has no expiry or is missing
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()>;
}

/// Builds a connected [`CounterStore`] on first use
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CounterStore>>;
}

/// Holds the remote store, constructing it only when first needed.
///
/// With no connector, or with network access switched off, the slot is
/// "not configured" and never attempts a connection.
pub struct RemoteStoreSlot {
    connector: Option<Arc<dyn StoreConnector>>,
    store: OnceCell<Arc<dyn CounterStore>>,
    reconnect_backoff: Duration,
    next_attempt_at: AtomicI64,
    time_source: Arc<dyn TimeSource>,
}

impl RemoteStoreSlot {
    pub fn new(
        connector: Option<Arc<dyn StoreConnector>>,
        network_access: bool,
        reconnect_backoff: Duration,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let connector = match connector {
            Some(_) if !network_access => {
                info!("Network access disabled, remote counter store will not be constructed");
                None
            }
            other => other,
        };

        Self {
            connector,
            store: OnceCell::new(),
            reconnect_backoff,
            next_attempt_at: AtomicI64::new(i64::MIN),
            time_source,
        }
    }

    /// A slot that is never configured (local-only mode)
    pub fn local_only(time_source: Arc<dyn TimeSource>) -> Self {
        Self::new(None, false, Duration::ZERO, time_source)
    }

    /// A slot around an already connected store
    pub fn connected(store: Arc<dyn CounterStore>, time_source: Arc<dyn TimeSource>) -> Self {
        let slot = Self::new(
            Some(Arc::new(ConnectedStore(store.clone())) as Arc<dyn StoreConnector>),
            true,
            Duration::ZERO,
            time_source,
        );
        let _ = slot.store.set(store);
        slot
    }

    pub fn is_configured(&self) -> bool {
        self.connector.is_some()
    }

    /// Get the store, connecting on first use.
    ///
    /// `Ok(None)` means not configured. A failed connection is an error and
    /// blocks further attempts until the reconnect backoff has elapsed.
    pub async fn get(&self) -> Result<Option<Arc<dyn CounterStore>>> {
        let Some(connector) = &self.connector else {
            return Ok(None);
        };

        if let Some(store) = self.store.get() {
            return Ok(Some(store.clone()));
        }

        let now = self.time_source.now_millis();
        if now < self.next_attempt_at.load(Ordering::Acquire) {
            return Err(RateLimitError::RemoteUnavailable(
                "waiting to reconnect".to_string(),
            ));
        }

        match self.store.get_or_try_init(|| connector.connect()).await {
            Ok(store) => Ok(Some(store.clone())),
            Err(e) => {
                warn!(
                    "Failed to connect remote counter store, retrying in {}ms: {}",
                    self.reconnect_backoff.as_millis(),
                    e
                );
                self.next_attempt_at.store(
                    now.saturating_add(duration_millis(self.reconnect_backoff)),
                    Ordering::Release,
                );
                Err(e)
            }
        }
    }
}

struct ConnectedStore(Arc<dyn CounterStore>);

#[async_trait]
impl StoreConnector for ConnectedStore {
    async fn connect(&self) -> Result<Arc<dyn CounterStore>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualTimeSource;
    use std::sync::atomic::AtomicUsize;

    struct NullStore;

    #[async_trait]
    impl CounterStore for NullStore {
        async fn increment(&self, _key: &str) -> Result<i64> {
            Ok(1)
        }

        async fn set_expiry(&self, _key: &str, _ttl: Duration) -> Result<()> {
            Ok(())
        }

        async fn remaining_ttl(&self, _key: &str) -> Result<Option<Duration>> {
            Ok(None)
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    struct CountingConnector {
        attempts: AtomicUsize,
        fail: bool,
    }

    impl CountingConnector {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                fail,
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StoreConnector for CountingConnector {
        async fn connect(&self) -> Result<Arc<dyn CounterStore>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RateLimitError::RemoteUnavailable("connection refused".to_string()))
            } else {
                Ok(Arc::new(NullStore))
            }
        }
    }

    #[tokio::test]
    async fn test_unconfigured_slot() {
        let slot = RemoteStoreSlot::local_only(Arc::new(ManualTimeSource::new(0)));
        assert!(!slot.is_configured());
        assert!(slot.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_network_access_disabled_never_connects() {
        let connector = CountingConnector::new(false);
        let slot = RemoteStoreSlot::new(
            Some(connector.clone() as Arc<dyn StoreConnector>),
            false,
            Duration::from_secs(1),
            Arc::new(ManualTimeSource::new(0)),
        );

        assert!(!slot.is_configured());
        assert!(slot.get().await.unwrap().is_none());
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_connects_once_on_first_use() {
        let connector = CountingConnector::new(false);
        let slot = RemoteStoreSlot::new(
            Some(connector.clone() as Arc<dyn StoreConnector>),
            true,
            Duration::from_secs(1),
            Arc::new(ManualTimeSource::new(0)),
        );
        assert_eq!(connector.attempts(), 0);

        assert!(slot.get().await.unwrap().is_some());
        assert!(slot.get().await.unwrap().is_some());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_backs_off() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let connector = CountingConnector::new(true);
        let slot = RemoteStoreSlot::new(
            Some(connector.clone() as Arc<dyn StoreConnector>),
            true,
            Duration::from_secs(5),
            clock.clone(),
        );

        assert!(slot.get().await.is_err());
        assert_eq!(connector.attempts(), 1);

        // Inside the backoff no new attempt is made
        clock.advance(Duration::from_secs(1));
        let err = slot.get().await.err().unwrap();
        assert!(err.is_remote());
        assert_eq!(connector.attempts(), 1);

        clock.advance(Duration::from_secs(5));
        assert!(slot.get().await.is_err());
        assert_eq!(connector.attempts(), 2);
    }
}
