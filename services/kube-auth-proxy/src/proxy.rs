//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, and forwards them to
//! the upstream API server through the guarded transport. Upstream responses
//! are returned verbatim, including non-401 error statuses. While the guard
//! reports authentication as broken, requests are answered locally with 503.

use auth_guard::{AuthInvalidError, AuthState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};
use transport::{BoxError, Transport};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest inbound body accepted for forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Seconds clients are told to wait while recovery is in progress.
const RECOVERING_RETRY_AFTER_SECS: &str = "5";

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    /// Used only to build requests; `transport` executes them.
    pub client: reqwest::Client,
    pub transport: Arc<dyn Transport>,
    pub upstream_url: String,
    pub timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// 503 for a request refused or failed because authentication is broken.
///
/// Carries the state the guard reported so clients can tell a recovery in
/// progress (retry soon) from a dead credential (re-authenticate).
fn auth_error_response(err: &AuthInvalidError, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "auth_invalid",
            "state": err.state.as_str(),
            "message": err.reason,
            "request_id": request_id,
        }
    });
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response();
    if err.state == AuthState::Recovering {
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            axum::http::HeaderValue::from_static(RECOVERING_RETRY_AFTER_SECS),
        );
    }
    response
}

fn is_timeout(err: &BoxError) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .is_some_and(reqwest::Error::is_timeout)
}

/// Proxy an inbound request to upstream through the guarded transport.
///
/// Timeouts get 2 retries with 100ms fixed backoff; auth failures and other
/// transport errors are answered immediately.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let response = forward(state, request, &request_id).await;

    state.requests_total.fetch_add(1, Ordering::Relaxed);
    if response.status().is_server_error() {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    // Build the upstream URL by appending the request path and query
    let upstream_url = if let Some(pq) = uri.path_and_query() {
        format!("{}{}", state.upstream_url.trim_end_matches('/'), pq)
    } else {
        state.upstream_url.clone()
    };

    // Collect request headers, stripping hop-by-hop and the inbound host
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && *name != axum::http::header::HOST {
            headers.insert(name.clone(), value.clone());
        }
    }

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    let max_attempts = 3u32;
    let retry_delay = Duration::from_millis(100);

    for attempt in 0..max_attempts {
        if attempt > 0 {
            warn!(attempt, "retrying after upstream timeout");
            tokio::time::sleep(retry_delay).await;
        }

        let upstream_request = match state
            .client
            .request(method.clone(), &upstream_url)
            .headers(headers.clone())
            .timeout(state.timeout)
            .body(body_bytes.clone())
            .build()
        {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "failed to build upstream request");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid upstream request: {e}"),
                    request_id,
                );
            }
        };

        match state.transport.execute(upstream_request).await {
            Ok(upstream_response) => return relay(upstream_response, request_id).await,
            Err(e) => {
                if let Some(auth) = AuthInvalidError::find(e.as_ref()) {
                    debug!(state = %auth.state, reason = %auth.reason, "request refused, authentication not valid");
                    metrics::record_upstream_error("auth_invalid");
                    return auth_error_response(auth, request_id);
                }
                if is_timeout(&e) && attempt < max_attempts - 1 {
                    continue;
                }
                if is_timeout(&e) {
                    metrics::record_upstream_error("timeout");
                    error!(error = %e, attempts = max_attempts, "upstream timeout after all retries");
                    return error_response(
                        StatusCode::GATEWAY_TIMEOUT,
                        &format!(
                            "upstream timeout after {}s ({max_attempts} attempts)",
                            state.timeout.as_secs()
                        ),
                        request_id,
                    );
                }
                metrics::record_upstream_error("connection");
                let message = transport::error_chain(e.as_ref());
                error!(error = %message, "upstream request failed");
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream error: {message}"),
                    request_id,
                );
            }
        }
    }

    // Every iteration returns or continues; the last attempt never continues.
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "unexpected retry exhaustion",
        request_id,
    )
}

/// Copy an upstream response back to the client, minus hop-by-hop headers.
async fn relay(upstream_response: reqwest::Response, request_id: &str) -> Response {
    let status = upstream_response.status();
    let resp_headers = upstream_response.headers().clone();

    match upstream_response.bytes().await {
        Ok(resp_body) => {
            let mut response = Response::builder().status(status);
            for (name, value) in &resp_headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(resp_body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("response build error: {e}"),
                        request_id,
                    )
                })
        }
        Err(e) => {
            metrics::record_upstream_error("body");
            error!(error = %e, "failed to read upstream response body");
            error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream response read error: {e}"),
                request_id,
            )
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
