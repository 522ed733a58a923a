use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{RateLimitError, Result};

/// Limit and window for one operation in one environment tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    limit: u64,
    window: Duration,
}

impl RateLimitConfig {
    /// Build a config, rejecting a zero limit or a window shorter than a millisecond
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(RateLimitError::Config(
                "rate limit must be a positive number of requests".to_string(),
            ));
        }
        if window.as_millis() == 0 {
            return Err(RateLimitError::Config(
                "rate limit window must be at least one millisecond".to_string(),
            ));
        }
        Ok(Self { limit, window })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_millis(&self) -> i64 {
        crate::utils::duration_millis(self.window)
    }
}

/// Named operations that carry their own quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Auth,
    Upload,
    PostCreate,
    TagCreate,
    Api,
    Search,
    Bookmark,
    Favorite,
    MediaResolve,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::Auth,
        Operation::Upload,
        Operation::PostCreate,
        Operation::TagCreate,
        Operation::Api,
        Operation::Search,
        Operation::Bookmark,
        Operation::Favorite,
        Operation::MediaResolve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Auth => "auth",
            Operation::Upload => "upload",
            Operation::PostCreate => "post_create",
            Operation::TagCreate => "tag_create",
            Operation::Api => "api",
            Operation::Search => "search",
            Operation::Bookmark => "bookmark",
            Operation::Favorite => "favorite",
            Operation::MediaResolve => "media_resolve",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = RateLimitError;

    fn from_str(name: &str) -> Result<Self> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == name)
            .ok_or_else(|| RateLimitError::UnknownOperation(name.to_string()))
    }
}

/// Production and development configs for one operation
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub production: RateLimitConfig,
    pub development: RateLimitConfig,
}

/// Raw (limit, window) pairs before validation
#[derive(Debug, Clone, Copy)]
pub struct TierSpec {
    pub production: (u64, Duration),
    pub development: (u64, Duration),
}

/// Enum-keyed table of operation limits, validated when built
#[derive(Debug, Clone)]
pub struct RateLimitTable {
    limits: HashMap<Operation, TierLimits>,
}

const MINUTE: Duration = Duration::from_secs(60);

fn builtin_specs() -> [(Operation, TierSpec); 9] {
    let tier = |prod: (u64, Duration), dev: (u64, Duration)| TierSpec {
        production: prod,
        development: dev,
    };
    [
        (
            Operation::Auth,
            tier((5, 15 * MINUTE), (50, 15 * MINUTE)),
        ),
        (Operation::Upload, tier((10, MINUTE), (100, MINUTE))),
        (Operation::PostCreate, tier((5, MINUTE), (50, MINUTE))),
        (Operation::TagCreate, tier((20, MINUTE), (200, MINUTE))),
        (Operation::Api, tier((100, MINUTE), (1000, MINUTE))),
        (Operation::Search, tier((30, MINUTE), (300, MINUTE))),
        (Operation::Bookmark, tier((60, MINUTE), (600, MINUTE))),
        (Operation::Favorite, tier((60, MINUTE), (600, MINUTE))),
        (Operation::MediaResolve, tier((60, MINUTE), (600, MINUTE))),
    ]
}

impl RateLimitTable {
    /// Compile a table, failing on any non-positive value or missing operation
    pub fn compile<I>(specs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Operation, TierSpec)>,
    {
        let mut limits = HashMap::new();

        for (operation, spec) in specs {
            let build = |(limit, window): (u64, Duration), tier: &str| {
                RateLimitConfig::new(limit, window).map_err(|e| {
                    RateLimitError::Config(format!("{} ({} tier): {}", operation, tier, e))
                })
            };
            let tiers = TierLimits {
                production: build(spec.production, "production")?,
                development: build(spec.development, "development")?,
            };
            limits.insert(operation, tiers);
        }

        if let Some(missing) = Operation::ALL.iter().find(|op| !limits.contains_key(*op)) {
            return Err(RateLimitError::Config(format!(
                "no rate limit configured for operation {}",
                missing
            )));
        }

        Ok(Self { limits })
    }

    /// The compiled-in table
    pub fn builtin() -> &'static RateLimitTable {
        static TABLE: OnceLock<RateLimitTable> = OnceLock::new();
        TABLE.get_or_init(|| {
            RateLimitTable::compile(builtin_specs()).expect("built-in rate limit table is valid")
        })
    }

    pub fn get(&self, operation: Operation, is_production: bool) -> Option<RateLimitConfig> {
        self.limits.get(&operation).map(|tiers| {
            if is_production {
                tiers.production
            } else {
                tiers.development
            }
        })
    }

    /// Resolve an operation name for the given environment tier
    pub fn resolve(&self, operation_name: &str, is_production: bool) -> Result<RateLimitConfig> {
        let operation: Operation = operation_name.parse()?;
        self.get(operation, is_production)
            .ok_or_else(|| RateLimitError::UnknownOperation(operation_name.to_string()))
    }
}

/// Resolve against the built-in table
pub fn resolve(operation_name: &str, is_production: bool) -> Result<RateLimitConfig> {
    RateLimitTable::builtin().resolve(operation_name, is_production)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_non_positive_values() {
        assert!(matches!(
            RateLimitConfig::new(0, MINUTE),
            Err(RateLimitError::Config(_))
        ));
        assert!(matches!(
            RateLimitConfig::new(10, Duration::ZERO),
            Err(RateLimitError::Config(_))
        ));
        assert!(matches!(
            RateLimitConfig::new(10, Duration::from_micros(500)),
            Err(RateLimitError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_known_operations() {
        let auth = resolve("auth", true).unwrap();
        assert_eq!(auth.limit(), 5);
        assert_eq!(auth.window(), Duration::from_secs(900));

        let search = resolve("search", false).unwrap();
        assert_eq!(search.limit(), 300);
        assert_eq!(search.window_millis(), 60_000);
    }

    #[test]
    fn test_resolve_unknown_operation() {
        let err = resolve("teleport", true).unwrap_err();
        assert!(matches!(err, RateLimitError::UnknownOperation(name) if name == "teleport"));

        // Names are exact, no case folding
        assert!(resolve("AUTH", true).is_err());
    }

    #[test]
    fn test_production_is_stricter_everywhere() {
        let table = RateLimitTable::builtin();
        for op in Operation::ALL {
            let prod = table.get(op, true).unwrap();
            let dev = table.get(op, false).unwrap();
            let prod_rate = prod.limit() as f64 / prod.window().as_secs_f64();
            let dev_rate = dev.limit() as f64 / dev.window().as_secs_f64();
            assert!(prod_rate < dev_rate, "{} is not stricter in production", op);
        }
    }

    #[test]
    fn test_operation_names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
    }

    #[test]
    fn test_compile_rejects_zero_limit() {
        let mut specs = builtin_specs();
        specs[2].1.production = (0, MINUTE);

        let err = RateLimitTable::compile(specs).unwrap_err();
        match err {
            RateLimitError::Config(msg) => {
                assert!(msg.contains("post_create"));
                assert!(msg.contains("production"));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_compile_rejects_missing_operation() {
        let specs: Vec<_> = builtin_specs()
            .into_iter()
            .filter(|(op, _)| *op != Operation::MediaResolve)
            .collect();

        let err = RateLimitTable::compile(specs).unwrap_err();
        assert!(matches!(err, RateLimitError::Config(msg) if msg.contains("media_resolve")));
    }

    #[test]
    fn test_resolve_is_pure() {
        assert_eq!(resolve("upload", true).unwrap(), resolve("upload", true).unwrap());
        assert_ne!(resolve("upload", true).unwrap(), resolve("upload", false).unwrap());
    }
}
