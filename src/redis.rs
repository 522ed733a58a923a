use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, RedisResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::{CounterStore, StoreConnector},
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(250),
        }
    }
}

/// Redis-backed shared counter
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisCounterStore {
    /// Connect to Redis and verify the connection with PING
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection = match tokio::time::timeout(
            config.connection_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    config.connection_timeout.as_millis()
                );
                return Err(RateLimitError::Timeout("connect".to_string()));
            }
        };

        let store = Self { connection, config };
        store.health_check().await?;

        info!("Redis counter store initialized successfully");
        Ok(store)
    }

    /// Run a command future under the command timeout
    async fn timed<T, F>(&self, command: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Timeout(command.to_string())),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        self.timed("INCR", conn.incr(key, 1i64)).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(millis);
        let _: i64 = self.timed("PEXPIRE", cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let millis: i64 = self.timed("PTTL", cmd.query_async(&mut conn)).await?;

        // -1: no expiry, -2: no such key
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let cmd = redis::cmd("PING");
        self.timed::<(), _>("PING", cmd.query_async(&mut conn)).await
    }
}

/// Connects a [`RedisCounterStore`] the first time the limiter needs it
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: RedisConfig,
}

impl RedisConnector {
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn CounterStore>> {
        let store = RedisCounterStore::connect(self.config.clone()).await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert!(config.command_timeout < config.connection_timeout);
    }

    #[tokio::test]
    async fn test_invalid_url_is_remote_error() {
        let config = RedisConfig {
            url: "not a redis url".to_string(),
            ..Default::default()
        };

        let err = RedisCounterStore::connect(config).await.err().unwrap();
        assert!(err.is_remote());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_remote_error() {
        // Nothing listens on port 1; either refusal or the timeout ends the attempt
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(500),
            ..Default::default()
        };

        let connector = RedisConnector::new(config);
        let err = connector.connect().await.err().unwrap();
        assert!(err.is_remote());
    }
}
