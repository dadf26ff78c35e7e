//! Streaming SHA-256 digests of cached files.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::error::{CacheError, CacheResult};

/// Compute the lowercase hex SHA-256 of the file at `path`.
///
/// The file is streamed through the hasher, so memory use is constant
/// regardless of file size.  Blocking; async callers should go through
/// [`digest_of_async`].
pub fn digest_of(path: &Path) -> CacheResult<String> {
    let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).map_err(|e| CacheError::io(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// [`digest_of`] on the blocking thread pool.
pub async fn digest_of_async(path: &Path) -> CacheResult<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || digest_of(&owned))
        .await
        .map_err(|e| CacheError::io(path, io::Error::other(e)))?
}
