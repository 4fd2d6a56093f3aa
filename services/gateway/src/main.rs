//! Upstream Gateway
//!
//! Multi-tenant gateway in front of Anthropic-compatible messages APIs:
//! 1. Authenticates callers by gateway API key
//! 2. Picks an upstream account from the credential pool, refreshing OAuth
//!    tokens as needed
//! 3. Proxies `/v1/messages` (buffered or SSE) with one failover on 401
//! 4. Meters token usage and cost per request

mod auth;
mod config;
mod error;
mod metrics;
mod proxy;
mod request;
mod sse;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use cache::{TtlCache, spawn_sweep_task};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::ProviderProfiles;
use serde::Deserialize;
use store::{JsonStore, Store, UsageAggregate, now_ms, spawn_flush_task};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream_auth::LifecycleManager;
use upstream_pool::{AccountCache, CredentialPool, spawn_refresh_task};
use usage::{PricingTable, UsageMeter, UsageWriter};

use crate::auth::{ApiKeyCache, Authenticator, require_permission};
use crate::config::Config;
use crate::error::GatewayError;
use crate::proxy::{ProxyRequest, StreamProxy};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Optional request header selecting a provider profile by name.
const PROVIDER_HEADER: &str = "x-gateway-provider";

/// Default `/v1/usage` window when `from` is omitted.
const DEFAULT_USAGE_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
const USAGE_WINDOW_STEP_MS: u64 = 60 * 1000;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: Arc<StreamProxy>,
    auth: Arc<Authenticator>,
    profiles: ProviderProfiles,
    default_provider: String,
    pool: Arc<CredentialPool>,
    meter: Arc<UsageMeter>,
    writer: Arc<UsageWriter>,
    caches: Caches,
    prometheus: PrometheusHandle,
    started_at: Instant,
    max_body_bytes: usize,
}

/// The three cache namespaces, held for `/health` and the sweep tasks.
#[derive(Clone)]
struct Caches {
    account: Arc<AccountCache>,
    api_key: Arc<ApiKeyCache>,
    usage: Arc<TtlCache<UsageAggregate>>,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrently served requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/usage", get(usage_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(key) = flag_value(&args, "--hash-key") {
        println!("{}", store::hash_api_key(key));
        return Ok(());
    }

    // JSON logs with LOG_LEVEL / RUST_LOG support, credentials redacted
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(common::RedactingMakeWriter::new(std::io::stdout)),
        )
        .init();

    info!("starting upstream-gateway");

    // Install before any metric is emitted
    let prometheus = metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let config_path = Config::resolve_path(flag_value(&args, "--config"));
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let store = Arc::new(
        JsonStore::open(config.store.path.clone())
            .await
            .with_context(|| format!("failed to open store {}", config.store.path.display()))?,
    );
    info!(
        listen_addr = %config.server.listen_addr,
        store = %config.store.path.display(),
        providers = config.providers.len(),
        headers = config.headers.len(),
        "configuration loaded"
    );

    let caches = Caches {
        account: Arc::new(AccountCache::new(
            "account",
            config.cache.account_max_entries,
            Duration::from_secs(config.cache.account_ttl_secs),
        )),
        api_key: Arc::new(ApiKeyCache::new(
            "api_key",
            config.cache.api_key_max_entries,
            Duration::from_secs(config.cache.api_key_ttl_secs),
        )),
        usage: Arc::new(TtlCache::new(
            "usage",
            config.cache.usage_max_entries,
            Duration::from_secs(config.cache.usage_ttl_secs),
        )),
    };

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.server.connect_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let profiles = ProviderProfiles::new(config.providers.clone());
    let pricing = PricingTable::with_overrides(&config.pricing).context("invalid pricing table")?;

    let state = assemble_state(
        &config,
        store.clone(),
        profiles,
        pricing,
        caches.clone(),
        client,
        prometheus,
    );

    let sweep_interval = Duration::from_secs(config.cache.sweep_interval_secs);
    let mut background = vec![
        spawn_sweep_task(caches.account.clone(), sweep_interval),
        spawn_sweep_task(caches.api_key.clone(), sweep_interval),
        spawn_sweep_task(caches.usage.clone(), sweep_interval),
        spawn_flush_task(
            store.clone(),
            Duration::from_secs(config.store.flush_interval_secs),
        ),
    ];
    let lifecycle = state.lifecycle.clone();
    background.push(spawn_refresh_task(
        state.app.pool.clone(),
        lifecycle,
        Duration::from_secs(config.oauth.refresh_interval_secs),
        Duration::from_secs(config.oauth.refresh_threshold_secs),
        config.oauth.recheck_unhealthy,
    ));

    let writer = state.app.writer.clone();
    let app = build_router(state.app, config.server.max_connections);
    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the signal fires, not when the server starts
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    for task in background {
        task.abort();
    }
    writer.shutdown().await;
    if let Err(e) = store.flush().await {
        error!(error = %e, "failed to flush store counters on shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

/// Value following `flag` on the command line.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Router state plus the pieces only bootstrap needs.
struct Assembled {
    app: AppState,
    lifecycle: Arc<LifecycleManager>,
}

fn assemble_state(
    config: &Config,
    store: Arc<dyn Store>,
    profiles: ProviderProfiles,
    pricing: PricingTable,
    caches: Caches,
    client: reqwest::Client,
    prometheus: PrometheusHandle,
) -> Assembled {
    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        profiles.clone(),
        client.clone(),
        Duration::from_secs(config.oauth.health_timeout_secs),
    ));
    let pool = Arc::new(CredentialPool::new(store.clone(), caches.account.clone()));
    let meter = Arc::new(UsageMeter::new(store.clone(), pricing, caches.usage.clone()));
    let writer = Arc::new(UsageWriter::spawn(meter.clone(), config.usage.writer_config()));
    let proxy = Arc::new(StreamProxy::new(
        pool.clone(),
        lifecycle.clone(),
        meter.clone(),
        writer.clone(),
        client,
        Duration::from_secs(config.server.timeout_secs),
        config.headers.clone(),
    ));
    let auth = Arc::new(Authenticator::new(store, caches.api_key.clone()));

    Assembled {
        app: AppState {
            proxy,
            auth,
            profiles,
            default_provider: config.server.default_provider.clone(),
            pool,
            meter,
            writer,
            caches,
            prometheus,
            started_at: Instant::now(),
            max_body_bytes: config.server.max_body_bytes,
        },
        lifecycle,
    }
}

/// `POST /v1/messages`: authenticate, validate, then proxy.
async fn messages_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let started = Instant::now();
    let mut stream = false;

    let result = handle_messages(&state, request, &request_id, &mut stream).await;
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            if matches!(err, GatewayError::Internal(_)) {
                error!(request_id = %request_id, error = %err, "request failed");
            }
            err.into_response_with_id(&request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        stream,
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn handle_messages(
    state: &AppState,
    request: Request<Body>,
    request_id: &str,
    stream: &mut bool,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();
    let principal = state.auth.authenticate(&parts.headers).await?;

    let provider = requested_provider(&parts.headers).unwrap_or(state.default_provider.as_str());
    let profile = state
        .profiles
        .get(provider)
        .map_err(|_| GatewayError::Validation(format!("unknown provider {provider:?}")))?;
    require_permission(&principal, &profile.permission)?;

    let bytes = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| GatewayError::Validation(format!("failed to read request body: {e}")))?;
    let validated = request::validate(&bytes)?;
    *stream = validated.stream;

    state
        .proxy
        .forward(ProxyRequest {
            request_id: request_id.to_string(),
            principal,
            profile,
            client_headers: parts.headers,
            body: validated.body,
            model: validated.model,
            stream: validated.stream,
        })
        .await
}

fn requested_provider(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(PROVIDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    from: Option<u64>,
    to: Option<u64>,
}

/// `GET /v1/usage`: aggregate for the caller's owner over `[from, to)`.
async fn usage_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    match usage_report(&state, &headers, query).await {
        Ok(aggregate) => (StatusCode::OK, axum::Json(aggregate)).into_response(),
        Err(err) => err.into_response_with_id(&request_id),
    }
}

async fn usage_report(
    state: &AppState,
    headers: &HeaderMap,
    query: UsageQuery,
) -> Result<UsageAggregate, GatewayError> {
    let principal = state.auth.authenticate(headers).await?;
    let (from, to) = usage_window(&query, now_ms())?;
    state
        .meter
        .aggregate(&principal.owner_id, from, to)
        .await
        .map_err(|e| {
            warn!(error = %e, "usage aggregation failed");
            GatewayError::Internal("usage aggregation failed".into())
        })
}

/// Resolve `[from, to)`. A missing `to` is the end of the current minute so
/// repeated default queries share one usage cache entry.
fn usage_window(query: &UsageQuery, now: u64) -> Result<(u64, u64), GatewayError> {
    let to = query
        .to
        .unwrap_or((now / USAGE_WINDOW_STEP_MS + 1) * USAGE_WINDOW_STEP_MS);
    let from = query
        .from
        .unwrap_or_else(|| to.saturating_sub(DEFAULT_USAGE_WINDOW_MS));
    if from >= to {
        return Err(GatewayError::Validation(format!(
            "from ({from}) must be earlier than to ({to})"
        )));
    }
    Ok((from, to))
}

/// Health endpoint: pool, cache and usage-queue status.
/// Returns 503 when no upstream account is usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.health().await;
    let pool_ok = pool["status"] != "unhealthy";
    let (status_code, status) = if pool_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    let account_cache = state.caches.account.stats().await;
    let api_key_cache = state.caches.api_key.stats().await;
    let usage_cache = state.caches.usage.stats().await;

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "pool": pool,
        "caches": {
            "account": account_cache,
            "api_key": api_key_cache,
            "usage": usage_cache,
        },
        "usage_queue": {
            "pending": state.writer.pending(),
            "capacity": state.writer.capacity(),
        },
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
