//! Process settings loaded from an optional file and `RATELIMIT__*` env vars.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::{
    error::{RateLimitError, Result},
    limiter::LimiterOptions,
    redis::RedisConfig,
};

/// Deployment tier, selects the production or development limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentEnvironment {
    Production,
    #[default]
    Development,
}

impl DeploymentEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, DeploymentEnvironment::Production)
    }
}

/// Top-level settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub environment: DeploymentEnvironment,

    /// Turn rate limiting off entirely
    #[serde(default)]
    pub disabled: bool,

    /// Whether this process may open outbound connections at all
    #[serde(default = "default_network_access")]
    pub network_access: bool,

    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    #[serde(default)]
    pub redis: RemoteSettings,

    #[serde(default)]
    pub local: LocalSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: DeploymentEnvironment::default(),
            disabled: false,
            network_access: default_network_access(),
            http_addr: default_http_addr(),
            redis: RemoteSettings::default(),
            local: LocalSettings::default(),
        }
    }
}

/// Shared counter store settings; no URL means local-only mode
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    pub url: Option<String>,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            url: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            key_prefix: default_key_prefix(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

/// Local fallback store settings
#[derive(Debug, Clone, Deserialize)]
pub struct LocalSettings {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_over_limit_cache_size")]
    pub over_limit_cache_size: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            over_limit_cache_size: default_over_limit_cache_size(),
        }
    }
}

fn default_network_access() -> bool {
    true
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    2_000
}

fn default_command_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

fn default_reconnect_backoff_ms() -> u64 {
    5_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_over_limit_cache_size() -> u64 {
    10_000
}

impl Settings {
    /// Load settings from an optional file, then `RATELIMIT__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("RATELIMIT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the limiter cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.local.sweep_interval_ms == 0 {
            return Err(RateLimitError::Config(
                "local.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.redis.command_timeout_ms == 0 || self.redis.connection_timeout_ms == 0 {
            return Err(RateLimitError::Config(
                "redis timeouts must be positive".to_string(),
            ));
        }
        if let Some(url) = &self.redis.url {
            if url.trim().is_empty() {
                return Err(RateLimitError::Config("redis.url must not be empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment.is_production()
    }

    /// Redis connection settings, `None` in local-only mode
    pub fn redis_config(&self) -> Option<RedisConfig> {
        self.redis.url.as_ref().map(|url| RedisConfig {
            url: url.clone(),
            connection_timeout: Duration::from_millis(self.redis.connection_timeout_ms),
            command_timeout: Duration::from_millis(self.redis.command_timeout_ms),
        })
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.redis.reconnect_backoff_ms)
    }

    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            disabled: self.disabled,
            production: self.is_production(),
            key_prefix: self.redis.key_prefix.clone(),
            sweep_interval: Duration::from_millis(self.local.sweep_interval_ms),
            over_limit_cache_size: self.local.over_limit_cache_size,
        }
    }
}
