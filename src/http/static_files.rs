//! Plain HTTP mirror: `GET /static/{key}/get/{*path}`.
//!
//! Files are validated with a `HEAD` probe against the upstream: the cached
//! copy is served only while its size and modification time match.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, header},
    response::Response,
};
use tracing::instrument;

use super::handler::{AppError, resolve, upstream_url, validate_path_segment, with_cache_status};
use super::serve::serve_file;
use crate::AppState;
use crate::cache::{CacheKey, Freshness, Upstream};

#[instrument(skip(state), fields(%key, %path))]
pub async fn handle_static(
    State(state): State<Arc<AppState>>,
    Path((key, path)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let base = state
        .config
        .static_upstream(&key)
        .ok_or_else(|| AppError::NotFound(format!("unknown static registry {key:?}")))?;

    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        validate_path_segment(segment, "path segment")?;
    }

    let mut upstream = Upstream::new(upstream_url(base, &segments, None)?);
    if let Some(ua) = state.config.user_agent.as_deref()
        && let Ok(value) = HeaderValue::from_str(ua)
    {
        upstream = upstream.with_header(header::USER_AGENT, value);
    }

    let registry = format!("static/{key}");
    let cache_key = CacheKey::new(registry.as_str(), path.as_str());
    let resolved = resolve(&state, &registry, &cache_key, &upstream, &Freshness::Metadata).await?;

    Ok(with_cache_status(serve_file(&resolved.path, None).await?, &resolved))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::http::{HeaderMap, Method, StatusCode};
    use axum::routing::get;

    use super::*;
    use crate::cache::testing::{http_date, spawn_upstream, write_with_mtime};
    use crate::config::ServerConfig;
    use crate::http::testing::{TestApp, spawn_app_with};

    const INDEX: &str = "/alpine/v3.19/main/APKINDEX.tar.gz";

    /// Mirror with one file; `/alpine/flaky` always fails.
    async fn mirror() -> (TestApp, Arc<AtomicUsize>) {
        let gets = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                INDEX,
                get({
                    let gets = Arc::clone(&gets);
                    move |method: Method, headers: HeaderMap| async move {
                        if method == Method::GET {
                            gets.fetch_add(1, Ordering::SeqCst);
                        }
                        assert_eq!(headers[header::USER_AGENT], "mirror-test");
                        ([(header::LAST_MODIFIED, http_date(1_700_000_000))], "index-bytes")
                    }
                }),
            )
            .route(
                "/alpine/flaky",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
            );
        let upstream = spawn_upstream(router).await;

        let mut server = ServerConfig::default();
        server
            .static_files
            .insert("alpine".into(), format!("{upstream}/alpine/"));
        (spawn_app_with(server, Some("mirror-test")).await, gets)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (app, gets) = mirror().await;
        let url = format!("{}/static/alpine/get/v3.19/main/APKINDEX.tar.gz", app.base);

        let first = reqwest::get(&url).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-cache-status"], "MISS");
        assert_eq!(first.text().await.unwrap(), "index-bytes");

        let second = reqwest::get(&url).await.unwrap();
        assert_eq!(second.headers()["x-cache-status"], "HIT");
        assert_eq!(second.text().await.unwrap(), "index-bytes");
        assert_eq!(gets.load(Ordering::SeqCst), 1);
        assert!(app.cache_dir.path().join("static/alpine/v3.19/main/APKINDEX.tar.gz").is_file());
    }

    #[tokio::test]
    async fn changed_upstream_is_refetched() {
        let (app, gets) = mirror().await;
        let cached = app.cache_dir.path().join("static/alpine/v3.19/main/APKINDEX.tar.gz");
        write_with_mtime(&cached, b"old-bytes!!", 1_600_000_000);

        let resp = reqwest::get(format!("{}/static/alpine/get/v3.19/main/APKINDEX.tar.gz", app.base))
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-cache-status"], "EXPIRED");
        assert_eq!(resp.text().await.unwrap(), "index-bytes");
        assert_eq!(gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_upstream_serves_stale_or_forwards_status() {
        let (app, _) = mirror().await;
        let url = format!("{}/static/alpine/get/flaky", app.base);

        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        write_with_mtime(&app.cache_dir.path().join("static/alpine/flaky"), b"kept", 1);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-cache-status"], "STALE");
        assert_eq!(resp.text().await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn rejects_unknown_key_and_unsafe_paths() {
        let (app, _) = mirror().await;
        let resp = reqwest::get(format!("{}/static/debian/get/x", app.base)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = reqwest::get(format!("{}/static/alpine/get/a%5Cb", app.base)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = reqwest::get(format!("{}/static/alpine/get/a//b", app.base)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
