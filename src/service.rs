use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    config::RateLimitTable,
    error::{RateLimitError, Result},
    headers,
    identifier::{self, RequestContext},
    limiter::{RateLimitResult, RateLimiter},
    metrics::Metrics,
    utils::TimeSource,
};

/// Outcome of one admission request
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub operation: String,
    pub identifier: String,
    pub result: RateLimitResult,
    pub headers: HashMap<String, String>,
    pub retry_after_secs: Option<u64>,
}

impl Admission {
    pub fn allowed(&self) -> bool {
        self.result.allowed
    }
}

/// Admission control for request handlers: resolves the caller and the
/// operation's limit, runs the limiter and formats the response headers.
pub struct AdmissionService {
    limiter: Arc<RateLimiter>,
    table: RateLimitTable,
    production: bool,
    time_source: Arc<dyn TimeSource>,
    metrics: Arc<Metrics>,
}

impl AdmissionService {
    pub fn new(
        limiter: Arc<RateLimiter>,
        table: RateLimitTable,
        production: bool,
        time_source: Arc<dyn TimeSource>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            limiter,
            table,
            production,
            time_source,
            metrics,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Decide whether the caller in `context` may perform `operation`.
    ///
    /// Fails only for an operation with no configured limit.
    pub async fn admit(&self, operation: &str, context: &RequestContext) -> Result<Admission> {
        let config = match self.table.resolve(operation, self.production) {
            Ok(config) => config,
            Err(e) => {
                self.metrics.record_unknown_operation();
                return Err(e);
            }
        };

        let client = identifier::resolve(context);
        let identifier = format!("{}:{}", operation, client);
        let result = self.limiter.check(&identifier, &config).await;

        let retry_after_secs = headers::retry_after_secs(&result, self.time_source.now_millis());
        if !result.allowed {
            warn!(
                operation,
                client = %client,
                count = result.count,
                limit = config.limit(),
                retry_after_secs,
                "Rate limit exceeded"
            );
        }

        Ok(Admission {
            operation: operation.to_string(),
            identifier,
            headers: headers::format(&result),
            result,
            retry_after_secs,
        })
    }

    /// Health check for the service
    pub async fn health_check(&self) -> Result<()> {
        self.limiter.health_check().await
    }

    pub fn start(&self) {
        self.limiter.start();
        info!(production = self.production, "Admission service started");
    }

    pub async fn stop(&self) {
        self.limiter.stop().await;
        info!("Admission service stopped");
    }
}

impl std::fmt::Debug for AdmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("table", &self.table)
            .field("production", &self.production)
            .finish_non_exhaustive()
    }
}

/// Whether an admission error should be reported to the client as "not found"
pub fn is_unknown_operation(error: &RateLimitError) -> bool {
    matches!(error, RateLimitError::UnknownOperation(_))
}
