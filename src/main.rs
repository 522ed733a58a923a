use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use admission_ratelimit::{
    config::RateLimitTable,
    headers,
    identifier::RequestContext,
    limiter::RateLimiter,
    metrics::Metrics,
    redis::RedisConnector,
    service::{is_unknown_operation, AdmissionService},
    settings::Settings,
    store::{RemoteStoreSlot, StoreConnector},
    utils::{SystemTimeSource, TimeSource},
};

/// Principal id set by the authenticating proxy in front of this service
const PRINCIPAL_HEADER: &str = "x-authenticated-user";

#[derive(Clone)]
struct AppState {
    service: Arc<AdmissionService>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "admission_ratelimit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting admission rate limit service");

    let config_path = std::env::var("RATELIMIT_CONFIG").ok();
    let settings = Settings::load(config_path.as_deref())?;
    info!(
        environment = ?settings.environment,
        disabled = settings.disabled,
        remote = settings.redis.url.is_some(),
        "Settings loaded"
    );

    let metrics = Arc::new(Metrics::new()?);
    let service = Arc::new(create_service(&settings, metrics.clone()));
    service.start();

    let state = AppState {
        service: service.clone(),
        metrics,
    };

    let http_addr = settings.http_addr.parse::<SocketAddr>()?;
    let app = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/admit/:operation", post(admit_handler))
        .with_state(state);

    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        warn!("HTTP server error: {}", e);
    }

    service.stop().await;
    info!("Service stopped");
    Ok(())
}

fn create_service(settings: &Settings, metrics: Arc<Metrics>) -> AdmissionService {
    let time_source: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);

    let connector = settings
        .redis_config()
        .map(|config| Arc::new(RedisConnector::new(config)) as Arc<dyn StoreConnector>);
    if connector.is_none() {
        info!("No Redis URL configured, using local rate limiting only");
    }

    let remote = RemoteStoreSlot::new(
        connector,
        settings.network_access,
        settings.reconnect_backoff(),
        time_source.clone(),
    );

    let limiter = Arc::new(RateLimiter::new(
        settings.limiter_options(),
        remote,
        time_source.clone(),
        metrics.clone(),
    ));

    AdmissionService::new(
        limiter,
        RateLimitTable::builtin().clone(),
        settings.is_production(),
        time_source,
        metrics,
    )
}

async fn admit_handler(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    request_headers: HeaderMap,
) -> Response {
    let principal = request_headers
        .get(PRINCIPAL_HEADER)
        .and_then(|value| value.to_str().ok());
    let context = RequestContext::from_headers(principal, &request_headers);

    let admission = match state.service.admit(&operation, &context).await {
        Ok(admission) => admission,
        Err(e) if is_unknown_operation(&e) => {
            return (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let status = if admission.allowed() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response_headers = HeaderMap::new();
    headers::apply(&admission.result, &mut response_headers);
    if let Some(secs) = admission.retry_after_secs {
        response_headers.insert(RETRY_AFTER, HeaderValue::from(secs));
    }

    (status, response_headers, Json(admission)).into_response()
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
