//! Error taxonomy for the cache-or-fetch engine.

use std::path::PathBuf;

use axum::http::StatusCode;
use thiserror::Error;

/// Result alias used throughout [`crate::cache`].
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors produced by the store, the freshness validator and the local
/// archive indexer.
///
/// None of the producers retry internally; retry policy belongs to callers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Connection-level failure talking to the upstream.
    #[error("transport error talking to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Upstream answered with something other than `200 OK`.
    #[error("upstream {url} returned HTTP {status}")]
    Upstream { url: String, status: u16 },

    /// Local filesystem failure while creating, writing or renaming a cached
    /// file.
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failure reading, hashing or walking local files.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The metadata probe could not establish freshness (no usable
    /// `Last-Modified` header).
    #[error("cannot verify freshness of {url}: {reason}")]
    Unverifiable { url: String, reason: String },

    /// No local version matched a query.
    #[error("no local versions found for {namespace}-{name}")]
    NotFound { namespace: String, name: String },
}

impl CacheError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// HTTP status a caller should answer with when this error is terminal
    /// for a request.
    ///
    /// Upstream statuses are forwarded verbatim; transport failures become
    /// `502 Bad Gateway`.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Transport { .. } | Self::Unverifiable { .. } => StatusCode::BAD_GATEWAY,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Storage { .. } | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for the `outcome` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Storage { .. } => "storage_error",
            Self::Io { .. } => "io_error",
            Self::Unverifiable { .. } => "unverifiable",
            Self::NotFound { .. } => "not_found",
        }
    }
}
