//! PyPI simple repository proxy.
//!
//! - `GET /pypi/{key}/simple/{name}/` refreshes the project's JSON index and
//!   renders it as PEP 503 HTML with every link pointing back here.
//! - `GET /pypi/{key}/packages/{name}/{filename}` serves a distribution file,
//!   validated against the `sha256` published in the cached index.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument};

use super::handler::{
    AppError, request_base, resolve, resolve_link, upstream_url, validate_path_segment,
    with_cache_status,
};
use super::serve::serve_file;
use crate::AppState;
use crate::cache::{CacheKey, Freshness, Resolved, Upstream};
use crate::registry::pypi::{SIMPLE_JSON_ACCEPT, SimpleFile, SimpleIndex, USER_AGENT};

/// Where a project's index lives upstream and in the cache.
struct IndexLocation {
    registry: String,
    key: CacheKey,
    upstream: Upstream,
}

impl IndexLocation {
    fn new(state: &AppState, key: &str, name: &str) -> Result<Self, AppError> {
        let base = state
            .config
            .pypi_upstream(key)
            .ok_or_else(|| AppError::NotFound(format!("unknown pypi registry {key:?}")))?;
        validate_path_segment(name, "project name")?;

        let registry = format!("pypi/{key}");
        Ok(Self {
            key: CacheKey::new(registry.as_str(), format!("{name}/index.json")),
            registry,
            upstream: Upstream::new(upstream_url(base, &[name, ""], None)?)
                .user_agent(USER_AGENT)
                .accept(SIMPLE_JSON_ACCEPT),
        })
    }

    fn path(&self, state: &AppState) -> PathBuf {
        state.cache.path_for(&self.key)
    }

    /// Refetch the index, falling back to the cached copy.
    async fn refresh(&self, state: &AppState) -> Result<(Resolved, SimpleIndex), AppError> {
        let resolved = resolve(
            state,
            &self.registry,
            &self.key,
            &self.upstream,
            &Freshness::AlwaysRefresh,
        )
        .await?;
        let index = SimpleIndex::read(&resolved.path)
            .await
            .map_err(AppError::BadUpstream)?;
        Ok((resolved, index))
    }
}

#[instrument(skip(state, headers), fields(%key, %name))]
pub async fn handle_simple(
    State(state): State<Arc<AppState>>,
    Path((key, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let location = IndexLocation::new(&state, &key, &name)?;
    let (resolved, mut index) = location.refresh(&state).await?;

    index.rewrite_urls(&request_base(&headers), &key, &name);
    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        index.render_html(),
    )
        .into_response();
    Ok(with_cache_status(response, &resolved))
}

#[instrument(skip(state), fields(%key, %name, %filename))]
pub async fn handle_package(
    State(state): State<Arc<AppState>>,
    Path((key, name, filename)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let location = IndexLocation::new(&state, &key, &name)?;
    validate_path_segment(&filename, "filename")?;

    let file = match cached_entry(&location.path(&state), &filename).await {
        Some(file) => file,
        None => {
            debug!("file not in cached index, refreshing");
            let (_, index) = location.refresh(&state).await?;
            index.find_file(&filename).cloned().ok_or_else(|| {
                AppError::NotFound(format!("{filename} is not listed for project {name}"))
            })?
        }
    };

    let url = resolve_link(&location.upstream.url, &file.url)?;
    let strategy = match file.sha256() {
        Some(sha) => Freshness::Digest(sha.to_ascii_lowercase()),
        None => Freshness::Metadata,
    };
    let cache_key = CacheKey::new(location.registry.as_str(), format!("{name}/{filename}"));
    let upstream = Upstream::new(url).user_agent(USER_AGENT);
    let resolved = resolve(&state, &location.registry, &cache_key, &upstream, &strategy).await?;

    Ok(with_cache_status(
        serve_file(&resolved.path, Some(&filename)).await?,
        &resolved,
    ))
}

/// Look `filename` up in the cached index without touching the network.
async fn cached_entry(index_path: &std::path::Path, filename: &str) -> Option<SimpleFile> {
    match SimpleIndex::read(index_path).await {
        Ok(index) => index.find_file(filename).cloned(),
        Err(e) => {
            debug!(error = %e, "no usable cached index");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
