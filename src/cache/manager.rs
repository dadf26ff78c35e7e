//! Cache-or-fetch orchestration over the on-disk cache.
//!
//! Cached artifacts live under `{base_path}/{registry}/{resource}`.  The
//! [`CacheManager`] validates the local copy with the strategy the call site
//! chooses, refetches when needed, and degrades to serving a stale copy when
//! the refetch fails.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::error::CacheResult;
use super::freshness::{self, Freshness, Verdict};
use super::store::{self, Upstream};

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Identity of a cached artifact.
///
/// `registry` names the registry instance (e.g. `pypi/main`), `resource` is
/// the artifact's path relative to that registry's cache directory, and
/// `version` is informational.  Segments are expected to be validated by the
/// caller; the key only joins them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    registry: String,
    resource: String,
    version: Option<String>,
}

impl CacheKey {
    pub fn new(registry: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            resource: resource.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Path of this artifact relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for segment in self
            .registry
            .split('/')
            .chain(self.resource.split('/'))
            .filter(|s| !s.is_empty())
        {
            path.push(segment);
        }
        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.registry, self.resource)?;
        if let Some(v) = &self.version {
            write!(f, "@{v}")?;
        }
        Ok(())
    }
}

/// Whether `segment` may be used as one component of a cache path.
///
/// Rejects empty strings, `.` and `..`, and anything containing `/`, `\\`
/// or NUL.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// What the orchestrator produced for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    /// Verdict computed before any fetch.
    pub verdict: Verdict,
    /// Set when the refresh failed and an older local copy is being served.
    pub stale: bool,
    /// Bytes fetched from upstream, if a fetch happened and succeeded.
    pub fetched_bytes: Option<u64>,
    /// Wall time of the upstream fetch, if one was attempted.
    pub fetch_elapsed: Option<Duration>,
    /// Error kind of a failed refresh that was masked by a stale copy.
    pub fetch_error: Option<&'static str>,
}

impl Resolved {
    /// Value for the `X-Cache-Status` response header.
    pub fn cache_status(&self) -> &'static str {
        if self.stale {
            "STALE"
        } else {
            self.verdict.as_header_value()
        }
    }
}

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

/// Owns the cache root and the upstream HTTP client.
#[derive(Debug, Clone)]
pub struct CacheManager {
    /// Root directory of the cache (e.g. `/var/cache/pkghub`).
    pub base_path: PathBuf,
    http_client: reqwest::Client,
}

impl CacheManager {
    pub fn new(base_path: impl Into<PathBuf>, http_client: reqwest::Client) -> Self {
        Self {
            base_path: base_path.into(),
            http_client,
        }
    }

    /// Absolute on-disk path for `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.base_path.join(key.relative_path())
    }

    /// Compute the freshness verdict for `path` under `strategy`.
    ///
    /// Metadata-probe failures are logged and reported as `Expired`, since
    /// a copy whose freshness cannot be asserted must be refreshed.
    pub async fn verdict(&self, path: &Path, upstream: &Upstream, strategy: &Freshness) -> Verdict {
        let result = match strategy {
            Freshness::Metadata => {
                freshness::check_by_metadata(&self.http_client, path, upstream).await
            }
            Freshness::Digest(expected) => Ok(freshness::check_by_digest(path, expected).await),
            Freshness::AlwaysRefresh => freshness::check_always_refresh(path).await,
        };
        match result {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "freshness check failed");
                if has_local_copy(path).await {
                    Verdict::Expired
                } else {
                    Verdict::Missing
                }
            }
        }
    }

    /// Cache-or-fetch: make sure the slot for `key` holds usable content.
    ///
    /// `Hit` returns without touching the network.  Otherwise the artifact
    /// is fetched; if that fails and a local copy exists it is served stale,
    /// else the fetch error is returned.
    #[instrument(skip(self, upstream, strategy), fields(%key, url = %upstream.url))]
    pub async fn resolve(
        &self,
        key: &CacheKey,
        upstream: &Upstream,
        strategy: &Freshness,
    ) -> CacheResult<Resolved> {
        let path = self.path_for(key);
        let verdict = self.verdict(&path, upstream, strategy).await;

        if verdict == Verdict::Hit {
            debug!(path = %path.display(), "cache hit");
            return Ok(Resolved {
                path,
                verdict,
                stale: false,
                fetched_bytes: None,
                fetch_elapsed: None,
                fetch_error: None,
            });
        }

        let started = Instant::now();
        let result = store::fetch_and_store(&self.http_client, upstream, &path).await;
        let elapsed = started.elapsed();
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                if !has_local_copy(&path).await {
                    return Err(e);
                }
                warn!(path = %path.display(), error = %e, "refresh failed, serving stale copy");
                return Ok(Resolved {
                    path,
                    verdict,
                    stale: true,
                    fetched_bytes: None,
                    fetch_elapsed: Some(elapsed),
                    fetch_error: Some(e.kind()),
                });
            }
        };

        info!(path = %path.display(), ?verdict, bytes, ?elapsed, "cached from upstream");
        Ok(Resolved {
            path,
            verdict,
            stale: false,
            fetched_bytes: Some(bytes),
            fetch_elapsed: Some(elapsed),
            fetch_error: None,
        })
    }
}

/// Whether a regular file is cached at `path`.
async fn has_local_copy(path: &Path) -> bool {
    matches!(freshness::local_metadata(path).await, Ok(Some(_)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
