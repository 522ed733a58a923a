use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Which path produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Bypass,
    Remote,
    OverLimitCache,
    Local,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Bypass => "bypass",
            Backend::Remote => "remote",
            Backend::OverLimitCache => "over_limit_cache",
            Backend::Local => "local",
        }
    }
}

/// Metrics collector for the admission-control subsystem
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decisions
    checks: CounterVec,
    unknown_operations: Counter,

    // Remote store
    remote_failures: Counter,
    remote_check_duration: Histogram,
    over_limit_cache_hits: Counter,

    // Local fallback store
    local_entries: Gauge,
    swept_entries: Counter,
}

impl Metrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks = CounterVec::new(
            Opts::new(
                "ratelimit_checks_total",
                "Rate limit decisions by deciding backend and outcome",
            ),
            &["backend", "outcome"],
        )?;

        let unknown_operations = Counter::new(
            "ratelimit_unknown_operation_total",
            "Admission requests naming an operation with no configured limit",
        )?;

        let remote_failures = Counter::new(
            "ratelimit_remote_failures_total",
            "Remote counter store failures that fell back to the local store",
        )?;

        let remote_check_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_remote_check_duration_seconds",
            "Duration of the remote counter round trips for one check",
        ))?;

        let over_limit_cache_hits = Counter::new(
            "ratelimit_over_limit_cache_hits",
            "Denials answered from the local over-limit cache",
        )?;

        let local_entries = Gauge::new(
            "ratelimit_local_entries",
            "Identifiers tracked by the local fallback store",
        )?;

        let swept_entries = Counter::new(
            "ratelimit_swept_entries_total",
            "Expired local entries removed by the cleanup sweeper",
        )?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(unknown_operations.clone()))?;
        registry.register(Box::new(remote_failures.clone()))?;
        registry.register(Box::new(remote_check_duration.clone()))?;
        registry.register(Box::new(over_limit_cache_hits.clone()))?;
        registry.register(Box::new(local_entries.clone()))?;
        registry.register(Box::new(swept_entries.clone()))?;

        Ok(Self {
            registry,
            checks,
            unknown_operations,
            remote_failures,
            remote_check_duration,
            over_limit_cache_hits,
            local_entries,
            swept_entries,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a decision
    pub fn record_check(&self, backend: Backend, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.checks
            .with_label_values(&[backend.as_str(), outcome])
            .inc();
    }

    pub fn check_count(&self, backend: Backend, allowed: bool) -> u64 {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.checks
            .with_label_values(&[backend.as_str(), outcome])
            .get() as u64
    }

    pub fn record_unknown_operation(&self) {
        self.unknown_operations.inc();
    }

    pub fn record_remote_failure(&self) {
        self.remote_failures.inc();
    }

    pub fn remote_failures(&self) -> u64 {
        self.remote_failures.get() as u64
    }

    /// Create a timer for the remote path of one check
    pub fn start_remote_timer(&self) -> prometheus::HistogramTimer {
        self.remote_check_duration.start_timer()
    }

    pub fn record_over_limit_cache_hit(&self) {
        self.over_limit_cache_hits.inc();
    }

    pub fn set_local_entries(&self, count: usize) {
        self.local_entries.set(count as f64);
    }

    pub fn local_entries(&self) -> u64 {
        self.local_entries.get() as u64
    }

    pub fn record_swept_entries(&self, count: usize) {
        self.swept_entries.inc_by(count as f64);
    }

    pub fn swept_entries(&self) -> u64 {
        self.swept_entries.get() as u64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
