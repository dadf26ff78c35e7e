//! Local archive indexer.
//!
//! Collections served from a local directory have no index of their own: the
//! directory contents are the source of truth.  Every file named
//! `<namespace>-<name>-<major>.<minor>.<patch>.tar.gz` anywhere under the
//! root is one version.
//!
//! "Latest" is the record with the newest modification time, *not* the
//! highest semantic version, so re-uploading an old release makes it the
//! latest again.  Callers that need a different policy pass their own
//! comparator to [`VersionSet::latest_by`].

use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use super::error::{CacheError, CacheResult};

const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// One archive found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub version: String,
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// All archives of one `(namespace, name)` pair in discovery order.
///
/// The walk visits directory entries sorted by file name, so discovery order
/// (and therefore tie-breaking in [`VersionSet::latest`]) is stable across
/// filesystems.
#[derive(Debug, Clone, Default)]
pub struct VersionSet {
    pub namespace: String,
    pub name: String,
    pub records: Vec<VersionRecord>,
}

impl VersionSet {
    pub fn find(&self, version: &str) -> Option<&VersionRecord> {
        self.records.iter().find(|r| r.version == version)
    }

    /// The most recently modified record; ties go to the first discovered.
    pub fn latest(&self) -> CacheResult<&VersionRecord> {
        self.latest_by(by_modification_time)
    }

    /// The maximum record under `cmp`; ties go to the first discovered.
    pub fn latest_by<F>(&self, mut cmp: F) -> CacheResult<&VersionRecord>
    where
        F: FnMut(&VersionRecord, &VersionRecord) -> Ordering,
    {
        let mut records = self.records.iter();
        let first = records.next().ok_or_else(|| CacheError::NotFound {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        })?;
        Ok(records.fold(first, |best, candidate| {
            if cmp(candidate, best) == Ordering::Greater {
                candidate
            } else {
                best
            }
        }))
    }
}

/// Default "latest" ordering: modification time.
pub fn by_modification_time(a: &VersionRecord, b: &VersionRecord) -> Ordering {
    a.modified.cmp(&b.modified)
}

/// Walk `root` recursively and collect every archive of `namespace`-`name`.
pub fn list_local_versions(root: &Path, namespace: &str, name: &str) -> CacheResult<VersionSet> {
    let prefix = format!("{namespace}-{name}-");
    let mut set = VersionSet {
        namespace: namespace.to_string(),
        name: name.to_string(),
        records: Vec::new(),
    };

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            CacheError::io(path, io::Error::other(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let filename = entry.file_name().to_string_lossy();
        let Some(version) = parse_archive_version(&filename, &prefix) else {
            continue;
        };

        let meta = entry
            .metadata()
            .map_err(|e| CacheError::io(entry.path(), io::Error::other(e)))?;
        let modified = meta.modified().map_err(|e| CacheError::io(entry.path(), e))?;

        set.records.push(VersionRecord {
            version: version.to_string(),
            filename: filename.into_owned(),
            path: entry.path().to_path_buf(),
            size: meta.len(),
            modified,
        });
    }

    Ok(set)
}

/// Blocking [`list_local_versions`] moved off the async runtime.
pub async fn list_local_versions_async(
    root: &Path,
    namespace: &str,
    name: &str,
) -> CacheResult<VersionSet> {
    let (root_owned, namespace, name) = (root.to_path_buf(), namespace.to_string(), name.to_string());
    tokio::task::spawn_blocking(move || list_local_versions(&root_owned, &namespace, &name))
        .await
        .map_err(|e| CacheError::io(root, io::Error::other(e)))?
}

/// Extract `X.Y.Z` from `<prefix>X.Y.Z.tar.gz`.
fn parse_archive_version<'a>(filename: &'a str, prefix: &str) -> Option<&'a str> {
    let version = filename.strip_prefix(prefix)?.strip_suffix(ARCHIVE_SUFFIX)?;
    is_semver_triplet(version).then_some(version)
}

fn is_semver_triplet(s: &str) -> bool {
    let mut parts = 0;
    for part in s.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts == 3
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
