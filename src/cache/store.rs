//! Atomic fetch-and-persist of upstream resources.
//!
//! The response body is streamed into a uniquely named temp file next to the
//! destination and then renamed over it, so readers observe either the old
//! file or the complete new one.  A failed fetch removes its temp file and
//! leaves the destination untouched.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::error::{CacheError, CacheResult};

/// User-agent sent on every upstream request unless the descriptor
/// overrides it.
pub const DEFAULT_USER_AGENT: &str = concat!("pkghub/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Upstream descriptor
// ---------------------------------------------------------------------------

/// Remote location of a cached artifact plus the headers needed to fetch it.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub url: String,
    pub headers: HeaderMap,
}

impl Upstream {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn user_agent(self, value: &'static str) -> Self {
        self.with_header(header::USER_AGENT, HeaderValue::from_static(value))
    }

    pub fn accept(self, value: &'static str) -> Self {
        self.with_header(header::ACCEPT, HeaderValue::from_static(value))
    }
}

// ---------------------------------------------------------------------------
// Fetch and store
// ---------------------------------------------------------------------------

/// GET `upstream` and atomically replace `dest` with the response body.
///
/// Returns the number of body bytes written.  On any error `dest` is
/// unchanged and no temp file remains.
#[instrument(skip(client, upstream), fields(url = %upstream.url, dest = %dest.display()))]
pub async fn fetch_and_store(
    client: &reqwest::Client,
    upstream: &Upstream,
    dest: &Path,
) -> CacheResult<u64> {
    let transport = |source| CacheError::Transport {
        url: upstream.url.clone(),
        source,
    };

    let resp = client
        .get(&upstream.url)
        .header(header::USER_AGENT, DEFAULT_USER_AGENT)
        .headers(upstream.headers.clone())
        .send()
        .await
        .map_err(transport)?;

    let status = resp.status();
    if status != StatusCode::OK {
        return Err(CacheError::Upstream {
            url: upstream.url.clone(),
            status: status.as_u16(),
        });
    }

    let last_modified = resp
        .headers()
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);

    let parent = dest.parent().ok_or_else(|| {
        CacheError::storage(
            dest,
            io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"),
        )
    })?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| CacheError::storage(parent, e))?;

    let tmp = TempFileGuard::new(temp_path_for(dest));
    let mut file = tokio::fs::File::create(tmp.path())
        .await
        .map_err(|e| CacheError::storage(tmp.path(), e))?;

    let mut stream = resp.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(transport)?;
        file.write_all(&chunk)
            .await
            .map_err(|e| CacheError::storage(tmp.path(), e))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| CacheError::storage(tmp.path(), e))?;
    drop(file);

    if let Some(modified) = last_modified {
        let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
        filetime::set_file_mtime(tmp.path(), mtime)
            .map_err(|e| CacheError::storage(tmp.path(), e))?;
    }

    tokio::fs::rename(tmp.path(), dest)
        .await
        .map_err(|e| CacheError::storage(dest, e))?;
    tmp.disarm();

    debug!(bytes = written, "upstream resource stored");
    Ok(written)
}

/// Parse an HTTP-date (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Temp path colocated with `dest`: `.tmp.<name>.<nanos>.<random>`.
fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let random = uuid::Uuid::new_v4().simple();
    dest.with_file_name(format!(".tmp.{name}.{nanos}.{random}"))
}

/// Removes the temp file on drop unless the rename succeeded.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
