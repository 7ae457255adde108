//! Kubernetes API auth-guarded proxy
//!
//! Single-binary Rust service that:
//! 1. Listens for incoming Kubernetes API requests
//! 2. Injects the upstream bearer token (KUBE_TOKEN or a rotating token file)
//! 3. Forwards through the auth guard, which fails fast while credentials are broken
//! 4. Probes the API server in the background until authentication recovers

mod config;
mod credentials;
mod error;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use auth_guard::{AuthState, Manager, Snapshot};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{BoxError, ReqwestTransport, Transport};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::credentials::BearerTransport;
use crate::proxy::ProxyState;

/// Drain timeout for in-flight requests on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime counters reported by the health endpoint
#[derive(Debug, Clone)]
struct ServiceMetrics {
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    started_at: Instant,
}

impl ServiceMetrics {
    fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    manager: Manager,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/auth/retry", post(retry_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Recovery probe: `GET {upstream}{probe_path}` through the unguarded transport.
///
/// Must bypass the guard, which refuses every request while recovering.
async fn probe_upstream(
    client: reqwest::Client,
    base: Arc<dyn Transport>,
    url: String,
    timeout: Duration,
) -> std::result::Result<(), BoxError> {
    let request = client.get(&url).timeout(timeout).build()?;
    let response = base.execute(request).await?;
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        Ok(())
    } else {
        Err(Box::new(error::Error::ProbeStatus {
            path: response.url().path().to_string(),
            status: status.as_u16(),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting kube-auth-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install metrics recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        max_attempts = config.auth.max_attempts,
        probe_path = %config.auth.probe_path,
        "configuration loaded"
    );

    let timeout = Duration::from_secs(config.proxy.timeout_secs);
    let client = reqwest::Client::new();
    let base: Arc<dyn Transport> = Arc::new(BearerTransport::new(
        Arc::new(ReqwestTransport::new(client.clone())),
        config.auth.token.clone(),
    ));

    let manager = Manager::new(config.auth.manager_config().on_state_change(
        |state, reason| {
            metrics::set_auth_state(state);
            match state {
                AuthState::Valid => info!("upstream authentication restored"),
                AuthState::Recovering => warn!(%reason, "upstream authentication failed, recovering"),
                AuthState::Invalid => error!(%reason, "upstream authentication invalid"),
            }
        },
    ));
    metrics::set_auth_state(AuthState::Valid);

    // The probe needs the base transport, built after the manager config.
    let probe_url = format!(
        "{}{}",
        config.proxy.upstream_url.trim_end_matches('/'),
        config.auth.probe_path
    );
    {
        let client = client.clone();
        let base = base.clone();
        manager.set_recovery_test(move || {
            probe_upstream(client.clone(), base.clone(), probe_url.clone(), timeout)
        });
    }

    let metrics = ServiceMetrics::new();
    let guarded: Arc<dyn Transport> = Arc::new(manager.wrap_transport(Some(base)));

    let proxy_state = ProxyState {
        client,
        transport: guarded,
        upstream_url: config.proxy.upstream_url.clone(),
        timeout,
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        manager: manager.clone(),
        metrics,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

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

    // The drain timer starts at signal receipt, not at server start.
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    manager.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

fn snapshot_json(snapshot: &Snapshot) -> serde_json::Value {
    serde_json::json!({
        "auth_state": snapshot.state.as_str(),
        "reason": snapshot.reason,
    })
}

/// Health endpoint: auth state plus service counters.
/// Returns 200 while authentication is valid, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.manager.snapshot();
    let (status_code, status) = if snapshot.state == AuthState::Valid {
        (axum::http::StatusCode::OK, "healthy")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let mut body = snapshot_json(&snapshot);
    body["status"] = status.into();
    body["uptime_seconds"] = state.metrics.started_at.elapsed().as_secs().into();
    body["requests_served"] = state.metrics.requests_total.load(Ordering::Relaxed).into();
    body["errors_total"] = state.metrics.errors_total.load(Ordering::Relaxed).into();

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Manual retry: restarts recovery when authentication is invalid.
/// Accepted (202) regardless; the body reports the resulting state.
async fn retry_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.trigger_retry();
    let snapshot = state.manager.snapshot();
    info!(state = %snapshot.state, "retry requested via API");
    (
        axum::http::StatusCode::ACCEPTED,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        snapshot_json(&snapshot).to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all other requests to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
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
            Ok(mut sig) => {
                sig.recv().await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use auth_guard::ManagerConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::Secret;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tower::ServiceExt;

    use crate::credentials::TokenSource;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics::build_recorder().handle()
    }

    /// Wire the full transport stack against `upstream_url`, probing `/version`.
    fn test_app_state(upstream_url: &str, config: ManagerConfig) -> AppState {
        let client = reqwest::Client::new();
        let timeout = Duration::from_secs(5);
        let base: Arc<dyn Transport> = Arc::new(BearerTransport::new(
            Arc::new(ReqwestTransport::new(client.clone())),
            TokenSource::Static(Secret::new("test-token".to_string())),
        ));

        let manager = Manager::new(config);
        let probe_url = format!("{upstream_url}/version");
        {
            let client = client.clone();
            let base = base.clone();
            manager.set_recovery_test(move || {
                probe_upstream(client.clone(), base.clone(), probe_url.clone(), timeout)
            });
        }

        let metrics = ServiceMetrics::new();
        AppState {
            proxy: ProxyState {
                client,
                transport: Arc::new(manager.wrap_transport(Some(base))),
                upstream_url: upstream_url.to_string(),
                timeout,
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
            },
            manager,
            metrics,
            prometheus: test_prometheus_handle(),
        }
    }

    /// Mock API server: 401 for everything while `authorized` is false,
    /// otherwise echoes the path and Authorization header as JSON.
    async fn start_upstream(
        authorized: Arc<AtomicBool>,
        hits: Arc<AtomicUsize>,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let app = axum::Router::new().fallback(move |request: Request<Body>| {
                let authorized = authorized.clone();
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if !authorized.load(Ordering::SeqCst) {
                        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
                    }
                    let authorization = request
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = serde_json::json!({
                        "path": request.uri().path(),
                        "query": request.uri().query().unwrap_or(""),
                        "authorization": authorization,
                    });
                    (
                        StatusCode::OK,
                        [("x-upstream-echo", "true")],
                        axum::Json(body),
                    )
                        .into_response()
                }
            });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    async fn send(app: &Router, method: &str, uri: &str) -> axum::http::Response<Body> {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn json_body(response: axum::http::Response<Body>) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn wait_for(manager: &Manager, state: AuthState) {
        let mut rx = manager.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .expect("timed out waiting for auth state")
            .unwrap();
    }

    #[tokio::test]
    async fn health_reports_valid_state() {
        let state = test_app_state("http://unused", ManagerConfig::new(0));
        state.metrics.requests_total.fetch_add(5, Ordering::Relaxed);

        let app = build_router(state, 1000);
        let response = send(&app, "GET", "/health").await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["auth_state"], "valid");
        assert_eq!(json["reason"], "");
        assert_eq!(json["requests_served"], 5);
        assert_eq!(json["errors_total"], 0);
    }

    #[tokio::test]
    async fn health_reports_invalid_state_as_unavailable() {
        let state = test_app_state("http://unused", ManagerConfig::new(0));
        state.manager.report_failure("token has expired");

        let app = build_router(state, 1000);
        let response = send(&app, "GET", "/health").await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["auth_state"], "invalid");
        assert_eq!(json["reason"], "token has expired");
    }

    #[tokio::test]
    async fn proxy_forwards_with_bearer_token() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (upstream_url, _server) =
            start_upstream(Arc::new(AtomicBool::new(true)), hits.clone()).await;

        let app = build_router(test_app_state(&upstream_url, ManagerConfig::new(0)), 1000);
        let response = send(&app, "GET", "/api/v1/namespaces?limit=5").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream-echo").unwrap(), "true");
        let json = json_body(response).await;
        assert_eq!(json["path"], "/api/v1/namespaces");
        assert_eq!(json["query"], "limit=5");
        assert_eq!(json["authorization"], "Bearer test-token");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_upstream_fails_fast_afterwards() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (upstream_url, _server) =
            start_upstream(Arc::new(AtomicBool::new(false)), hits.clone()).await;

        let state = test_app_state(&upstream_url, ManagerConfig::new(0));
        let manager = state.manager.clone();
        let app = build_router(state, 1000);

        let first = send(&app, "GET", "/api/v1/pods").await;
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(first).await;
        assert_eq!(json["error"]["type"], "auth_invalid");
        assert_eq!(json["error"]["state"], "invalid");
        assert_eq!(json["error"]["message"], "401 Unauthorized");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            let response = send(&app, "GET", "/api/v1/pods").await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1, "blocked requests must not reach upstream");
        assert_eq!(manager.state().0, AuthState::Invalid);
    }

    #[tokio::test]
    async fn retry_endpoint_recovers_once_upstream_accepts_token() {
        let authorized = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));
        let (upstream_url, _server) = start_upstream(authorized.clone(), hits.clone()).await;

        let state = test_app_state(&upstream_url, ManagerConfig::new(2).backoff(vec![]));
        let manager = state.manager.clone();
        let app = build_router(state, 1000);

        // 401 triggers recovery; both probes are refused too.
        let response = send(&app, "GET", "/api/v1/pods").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        wait_for(&manager, AuthState::Invalid).await;
        assert_eq!(
            manager.state().1,
            auth_guard::RECOVERY_EXHAUSTED_REASON.to_string()
        );

        authorized.store(true, Ordering::SeqCst);
        let response = send(&app, "POST", "/auth/retry").await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        wait_for(&manager, AuthState::Valid).await;

        let response = send(&app, "GET", "/api/v1/pods").await;
        assert_eq!(response.status(), StatusCode::OK);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn retry_endpoint_is_noop_while_valid() {
        let state = test_app_state("http://unused", ManagerConfig::new(2));
        let manager = state.manager.clone();
        let app = build_router(state, 1000);

        let response = send(&app, "POST", "/auth/retry").await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_body(response).await;
        assert_eq!(json["auth_state"], "valid");
        assert!(manager.is_valid());
    }

    #[tokio::test]
    async fn unreachable_upstream_returns_bad_gateway() {
        let state = test_app_state("http://127.0.0.1:1", ManagerConfig::new(0));
        let manager = state.manager.clone();
        let app = build_router(state, 1000);

        let response = send(&app, "GET", "/api/v1/pods").await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert!(manager.is_valid(), "connection errors are not auth failures");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let app = build_router(test_app_state("http://unused", ManagerConfig::new(0)), 1000);

        let response = send(&app, "GET", "/metrics").await;

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    }
}
