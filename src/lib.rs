//! Admission control for request handlers.
//!
//! A fixed-window rate limiter that counts requests per caller in a shared
//! Redis store so every server instance enforces the same quota, falls back
//! to in-process counters when Redis is unreachable, and sweeps expired
//! local state in the background.

pub mod cache;
pub mod config;
pub mod error;
pub mod headers;
pub mod identifier;
pub mod limiter;
pub mod local;
pub mod metrics;
pub mod redis;
pub mod service;
pub mod settings;
pub mod store;
pub mod utils;

// Re-export main types
pub use config::{Operation, RateLimitConfig, RateLimitTable};
pub use error::{RateLimitError, Result};
pub use identifier::RequestContext;
pub use limiter::{LimiterOptions, RateLimitResult, RateLimiter};
pub use service::{Admission, AdmissionService};
pub use store::{CounterStore, RemoteStoreSlot, StoreConnector};
pub use utils::{ManualTimeSource, SystemTimeSource, TimeSource};
