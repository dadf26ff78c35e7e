//! Freshness validation for cached artifacts.
//!
//! Mirrored files have no trusted digest, only an upstream size and
//! timestamp, so they are checked with a `HEAD` probe.  Registry artifacts
//! ship a SHA-256 in their index metadata, so they are checked by hashing the
//! local copy.  Index documents themselves carry neither signal and are
//! always refreshed.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header;
use tracing::{debug, instrument, warn};

use super::digest::digest_of_async;
use super::error::{CacheError, CacheResult};
use super::store::{DEFAULT_USER_AGENT, Upstream, parse_http_date};

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Outcome of validating a cached copy against upstream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No local copy exists.
    Missing,
    /// The local copy is provably current.
    Hit,
    /// A local copy exists but is stale or could not be verified.
    Expired,
}

impl Verdict {
    /// Value for the `X-Cache-Status` response header.
    pub fn as_header_value(self) -> &'static str {
        match self {
            Self::Missing => "MISS",
            Self::Hit => "HIT",
            Self::Expired => "EXPIRED",
        }
    }
}

/// Validation strategy chosen by the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Compare local size and mtime with upstream `Content-Length` and
    /// `Last-Modified` from a `HEAD` request.
    Metadata,
    /// Compare the local SHA-256 with a digest taken from upstream metadata.
    Digest(String),
    /// Always refetch; the cached copy is only a fallback.
    AlwaysRefresh,
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Metadata probe: `Hit` only when both size and modification time match
/// upstream exactly.
#[instrument(skip(client, upstream), fields(url = %upstream.url, path = %path.display()))]
pub async fn check_by_metadata(
    client: &reqwest::Client,
    path: &Path,
    upstream: &Upstream,
) -> CacheResult<Verdict> {
    let Some(meta) = local_metadata(path).await? else {
        return Ok(Verdict::Missing);
    };

    let resp = client
        .head(&upstream.url)
        .header(header::USER_AGENT, DEFAULT_USER_AGENT)
        .headers(upstream.headers.clone())
        .send()
        .await
        .map_err(|source| CacheError::Transport {
            url: upstream.url.clone(),
            source,
        })?;

    if resp.status() != StatusCode::OK {
        return Err(CacheError::Upstream {
            url: upstream.url.clone(),
            status: resp.status().as_u16(),
        });
    }

    // Read the header directly: the body of a HEAD response is always empty.
    let remote_len = resp
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let remote_modified = resp
        .headers()
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .ok_or_else(|| CacheError::Unverifiable {
            url: upstream.url.clone(),
            reason: "missing or unparsable Last-Modified header".into(),
        })?;

    let local_modified: DateTime<Utc> = meta
        .modified()
        .map_err(|e| CacheError::io(path, e))?
        .into();

    let fresh = remote_len == Some(meta.len()) && local_modified == remote_modified;
    debug!(
        local_len = meta.len(),
        ?remote_len,
        %local_modified,
        %remote_modified,
        fresh,
        "metadata probe"
    );

    Ok(if fresh { Verdict::Hit } else { Verdict::Expired })
}

/// Digest comparison: `Hit` iff the local SHA-256 equals `expected`.
///
/// Never fails; a local copy that cannot be read or hashed is `Expired`.
#[instrument(skip(expected), fields(path = %path.display()))]
pub async fn check_by_digest(path: &Path, expected: &str) -> Verdict {
    match local_metadata(path).await {
        Ok(None) => return Verdict::Missing,
        Ok(Some(_)) => {}
        Err(e) => {
            warn!(error = %e, "cannot stat cached file, treating as expired");
            return Verdict::Expired;
        }
    }

    match digest_of_async(path).await {
        Ok(local) if local == expected => Verdict::Hit,
        Ok(local) => {
            warn!(%local, %expected, "digest mismatch for cached file");
            Verdict::Expired
        }
        Err(e) => {
            warn!(error = %e, "cannot hash cached file, treating as expired");
            Verdict::Expired
        }
    }
}

/// `Missing` when absent, otherwise `Expired` so the caller refetches.
pub async fn check_always_refresh(path: &Path) -> CacheResult<Verdict> {
    Ok(match local_metadata(path).await? {
        None => Verdict::Missing,
        Some(_) => Verdict::Expired,
    })
}

/// Stat `path`, mapping "does not exist" to `None`.
pub(crate) async fn local_metadata(path: &Path) -> CacheResult<Option<std::fs::Metadata>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta)),
        Ok(_) => Err(CacheError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "cached path is not a regular file"),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
