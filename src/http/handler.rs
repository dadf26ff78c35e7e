//! Main axum router, shared helpers and the error type for the proxy.
//!
//! Routes:
//! - `GET /ping`                                  - Liveness probe
//! - `GET /metrics`                               - Prometheus metrics
//! - `GET /static/{key}/get/{*path}`              - Plain HTTP mirror
//! - `GET /pypi/{key}/simple/{name}/`             - PEP 503 project page
//! - `GET /pypi/{key}/packages/{name}/{filename}` - Distribution file
//! - `GET /galaxy/{key}/api/...`, `/galaxy/{key}/get/...` - Ansible Galaxy v3

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use tracing::{error, info, warn};
use url::Url;

use crate::AppState;
use crate::cache::store::DEFAULT_USER_AGENT;
use crate::cache::{CacheError, CacheKey, Freshness, Resolved, Upstream, is_valid_segment};

pub(crate) const X_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(handle_ping))
        .route("/metrics", get(handle_metrics))
        // Static mirrors
        .route(
            "/static/{key}/get/{*path}",
            get(super::static_files::handle_static),
        )
        // PyPI
        .route(
            "/pypi/{key}/simple/{name}/",
            get(super::pypi::handle_simple),
        )
        .route(
            "/pypi/{key}/packages/{name}/{filename}",
            get(super::pypi::handle_package),
        )
        // Galaxy
        .route("/galaxy/{key}", any(super::galaxy::handle_root))
        .route("/galaxy/{key}/api", get(super::galaxy::handle_api))
        .route("/galaxy/{key}/api/", get(super::galaxy::handle_api))
        .route(
            "/galaxy/{key}/api/v3/collections/{namespace}/{name}/",
            get(super::galaxy::handle_collection),
        )
        .route(
            "/galaxy/{key}/api/v3/collections/{namespace}/{name}/versions/",
            get(super::galaxy::handle_versions),
        )
        .route(
            "/galaxy/{key}/api/v3/collections/{namespace}/{name}/versions/{version}/",
            get(super::galaxy::handle_version_info),
        )
        .route(
            "/galaxy/{key}/get/{namespace}/{name}/{version}",
            get(super::galaxy::handle_get),
        )
        .fallback(handle_not_found)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /ping`
async fn handle_ping() -> &'static str {
    "pong"
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

async fn handle_not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 page not found").into_response()
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// One log event per request, levelled by status class, plus the `Server`
/// header.
async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(header::SERVER, HeaderValue::from_static(DEFAULT_USER_AGENT));

    let status = response.status().as_u16();
    let latency = started.elapsed();
    if response.status().is_server_error() {
        error!(%method, %uri, status, ?latency, "request");
    } else if response.status().is_client_error() {
        warn!(%method, %uri, status, ?latency, "request");
    } else {
        info!(%method, %uri, status, ?latency, "request");
    }
    response
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Validate that a path segment is safe to use in a cache path.
///
/// Rejects segments that are empty, `.` or `..`, or contain `/`, `\` or NUL.
pub(crate) fn validate_path_segment(segment: &str, label: &str) -> Result<(), AppError> {
    if is_valid_segment(segment) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("invalid {label}: {segment:?}")))
    }
}

/// `scheme://host` of the incoming request, for links handed back to
/// clients.
pub(crate) fn request_base(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| *s == "https" || *s == "http")
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

/// Append `segments` (percent-encoded) and `query` to the upstream `base`.
pub(crate) fn upstream_url(
    base: &str,
    segments: &[&str],
    query: Option<&str>,
) -> Result<String, AppError> {
    let mut url = Url::parse(base)
        .map_err(|e| AppError::Internal(anyhow!("invalid upstream URL {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| AppError::Internal(anyhow!("upstream URL {base} cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    url.set_query(query.filter(|q| !q.is_empty()));
    Ok(url.into())
}

/// Resolve a URL found in an upstream document against the document's URL.
pub(crate) fn resolve_link(document_url: &str, link: &str) -> Result<String, AppError> {
    Url::parse(document_url)
        .and_then(|base| base.join(link))
        .map(String::from)
        .map_err(|e| AppError::BadUpstream(anyhow!("invalid link {link:?} in {document_url}: {e}")))
}

/// Run the cache-or-fetch orchestrator and account for the outcome.
pub(crate) async fn resolve(
    state: &AppState,
    registry: &str,
    key: &CacheKey,
    upstream: &Upstream,
    strategy: &Freshness,
) -> Result<Resolved, AppError> {
    match state.cache.resolve(key, upstream, strategy).await {
        Ok(resolved) => {
            state.metrics.metrics.record_resolved(registry, &resolved);
            Ok(resolved)
        }
        Err(e) => {
            state.metrics.metrics.record_fetch(e.kind(), None);
            Err(e.into())
        }
    }
}

/// Attach `X-Cache-Status` for `resolved` to `response`.
pub(crate) fn with_cache_status(mut response: Response, resolved: &Resolved) -> Response {
    response.headers_mut().insert(
        X_CACHE_STATUS,
        HeaderValue::from_static(resolved.cache_status()),
    );
    response
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Unknown registry, collection, version or file.
    NotFound(String),
    /// Malformed request parameters.
    BadRequest(String),
    /// The cache-or-fetch engine failed with nothing to serve.
    Cache(CacheError),
    /// Upstream sent a document that cannot be used.
    BadUpstream(anyhow::Error),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Cache(err) => {
                let status = err.status_code();
                if status.is_server_error() {
                    error!(error = %err, "cache request failed");
                } else {
                    warn!(error = %err, "cache request failed");
                }
                let body = match err {
                    CacheError::Storage { .. } | CacheError::Io { .. } => {
                        "Internal server error\n".to_string()
                    }
                    other => format!("{other}\n"),
                };
                (status, body).into_response()
            }
            AppError::BadUpstream(err) => {
                error!(error = %err, "unusable upstream document");
                (StatusCode::BAD_GATEWAY, "Invalid upstream response\n").into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound { .. } => AppError::NotFound(err.to_string()),
            other => AppError::Cache(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
