//! Standard rate limit response headers.

use chrono::SecondsFormat;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

use crate::limiter::RateLimitResult;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";
pub const BLOCKED_HEADER: &str = "X-RateLimit-Blocked";

fn fields(result: &RateLimitResult) -> [(&'static str, String); 4] {
    [
        (LIMIT_HEADER, result.limit().to_string()),
        (REMAINING_HEADER, result.remaining.to_string()),
        (
            RESET_HEADER,
            result.reset_at().to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        (BLOCKED_HEADER, result.blocked.to_string()),
    ]
}

/// Header name to value for a decision
pub fn format(result: &RateLimitResult) -> HashMap<String, String> {
    fields(result)
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Write the rate limit headers into an outgoing header map
pub fn apply(result: &RateLimitResult, headers: &mut HeaderMap) {
    for (name, value) in fields(result) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Seconds a denied caller should wait, at least one; `None` when allowed
pub fn retry_after_secs(result: &RateLimitResult, now_millis: i64) -> Option<u64> {
    if result.allowed {
        return None;
    }
    let wait_millis = result.reset_time.saturating_sub(now_millis).max(0) as u64;
    Some(wait_millis.div_ceil(1000).max(1))
}
