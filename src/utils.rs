use chrono::{DateTime, TimeZone, Utc};
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of wall-clock time for window math and TTLs, in epoch milliseconds
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Time source backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Time source that only moves when told to.
///
/// Lets tests step across window boundaries without sleeping.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert a duration to whole milliseconds, saturating at i64::MAX
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Convert epoch milliseconds to a UTC timestamp
pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Generate the shared-store key for an identifier
pub fn generate_cache_key(prefix: &str, identifier: &str) -> String {
    format!("{}{}", prefix, identifier)
}

/// Whether the identifier names a loopback origin (`ip:127.0.0.1`,
/// `ip:::1`, `ip:localhost`, possibly behind an operation scope such as
/// `auth:ip:127.0.0.1`).
pub fn is_loopback_identifier(identifier: &str) -> bool {
    // Either `ip:<addr>` or `<operation>:ip:<addr>`
    let address = identifier.strip_prefix("ip:").or_else(|| {
        identifier
            .split_once(':')
            .and_then(|(_, rest)| rest.strip_prefix("ip:"))
    });
    let Some(address) = address else {
        return false;
    };
    let address = address.trim();
    if address.eq_ignore_ascii_case("localhost") {
        return true;
    }
    address
        .parse::<IpAddr>()
        .map(|ip| ip.to_canonical().is_loopback())
        .unwrap_or(false)
}
