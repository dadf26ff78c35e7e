//! Ansible Galaxy v3 collection API documents.
//!
//! Proxied documents are cached as the upstream sent them; every link that
//! would lead a client back to the upstream is rewritten on the way out.
//! Documents for locally published collections are synthesized from the
//! archives on disk.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::cache::local::{VersionRecord, VersionSet};

/// User-agent presented to Galaxy upstreams.
pub const USER_AGENT: &str = "ansible-galaxy";

// ---------------------------------------------------------------------------
// Local API paths
// ---------------------------------------------------------------------------

/// Builds the proxy-relative API paths for one collection.
#[derive(Debug, Clone, Copy)]
pub struct Links<'a> {
    pub key: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

impl Links<'_> {
    pub fn collection(&self) -> String {
        format!("/galaxy/{}/api/v3/collections/{}/{}/", self.key, self.namespace, self.name)
    }

    pub fn versions(&self) -> String {
        format!("{}versions/", self.collection())
    }

    pub fn versions_page(&self, query: &str) -> String {
        if query.is_empty() {
            self.versions()
        } else {
            format!("{}?{query}", self.versions())
        }
    }

    pub fn version(&self, version: &str) -> String {
        format!("{}{version}/", self.versions())
    }

    /// Absolute artifact download URL under `base` (`scheme://host`).
    pub fn download(&self, base: &str, version: &str) -> String {
        format!("{base}/galaxy/{}/get/{}/{}/{version}", self.key, self.namespace, self.name)
    }

    pub fn archive_name(&self, version: &str) -> String {
        format!("{}-{}-{version}.tar.gz", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// `GET /api` discovery document.
#[derive(Debug, Clone, Serialize)]
pub struct ApiVersions {
    pub available_versions: AvailableVersions,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableVersions {
    pub v3: &'static str,
}

impl Default for ApiVersions {
    fn default() -> Self {
        Self {
            available_versions: AvailableVersions { v3: "v3/" },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub versions_url: String,
    #[serde(default)]
    pub highest_version: HighestVersion,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub download_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HighestVersion {
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub version: String,
}

impl Collection {
    pub fn rewrite_links(&mut self, links: &Links<'_>) {
        self.href = links.collection();
        self.versions_url = links.versions();
        self.highest_version.href = links.version(&self.highest_version.version);
    }

    /// Collection document for a local directory; `latest` decides
    /// `highest_version`.
    pub fn from_local(links: &Links<'_>, latest: &VersionRecord) -> Self {
        Self {
            href: links.collection(),
            namespace: links.namespace.to_string(),
            name: links.name.to_string(),
            versions_url: links.versions(),
            highest_version: HighestVersion {
                href: links.version(&latest.version),
                version: latest.version.clone(),
            },
            updated_at: Some(latest.modified.into()),
            ..Self::default()
        }
    }
}

/// One page of `GET .../versions/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionsPage {
    #[serde(default)]
    pub meta: PageMeta,
    #[serde(default)]
    pub links: PageLinks,
    #[serde(default)]
    pub data: Vec<VersionSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageLinks {
    pub first: Option<String>,
    pub previous: Option<String>,
    pub next: Option<String>,
    pub last: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requires_ansible: Option<String>,
    #[serde(default)]
    pub marks: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VersionsPage {
    /// Re-point pagination links and entry hrefs at the proxy, keeping each
    /// link's query string.  `upstream` resolves relative links.
    pub fn rewrite_links(&mut self, links: &Links<'_>, upstream: &Url) {
        for link in [
            &mut self.links.first,
            &mut self.links.previous,
            &mut self.links.next,
            &mut self.links.last,
        ] {
            if let Some(target) = link.as_deref().filter(|l| !l.is_empty()) {
                let query = upstream
                    .join(target)
                    .ok()
                    .and_then(|u| u.query().map(str::to_owned))
                    .unwrap_or_default();
                *link = Some(links.versions_page(&query));
            }
        }
        for entry in &mut self.data {
            entry.href = links.version(&entry.version);
        }
    }

    /// Single page listing every local archive in discovery order.
    pub fn from_local(links: &Links<'_>, set: &VersionSet) -> Self {
        Self {
            meta: PageMeta {
                count: set.records.len() as u64,
            },
            links: PageLinks::default(),
            data: set
                .records
                .iter()
                .map(|r| VersionSummary {
                    version: r.version.clone(),
                    href: links.version(&r.version),
                    updated_at: Some(r.modified.into()),
                    ..VersionSummary::default()
                })
                .collect(),
        }
    }
}

/// `GET .../versions/{version}/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifact: Artifact,
    #[serde(default)]
    pub collection: CollectionRef,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: NamespaceRef,
    #[serde(default)]
    pub signatures: Vec<Value>,
    #[serde(default)]
    pub metadata: CollectionMetadata,
    #[serde(default)]
    pub manifest: Value,
    #[serde(default)]
    pub files: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub href: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata_sha256: Option<String>,
}

/// Descriptive metadata; also the shape of `collection_info` in
/// `MANIFEST.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionMetadata {
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub dependencies: Map<String, Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub issues: Option<String>,
    #[serde(default)]
    pub license: Vec<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl VersionInfo {
    /// Re-point `href`, `collection.href` and `download_url` at the proxy.
    pub fn rewrite_links(&mut self, links: &Links<'_>, base: &str) {
        self.href = links.version(&self.version);
        self.collection.href = links.collection();
        self.download_url = links.download(base, &self.version);
    }

    /// Version document for a local archive, built from its embedded
    /// `MANIFEST.json` and `FILES.json`.
    pub fn from_local(
        links: &Links<'_>,
        base: &str,
        record: &VersionRecord,
        contents: ArchiveContents,
        sha256: String,
    ) -> Self {
        let metadata = contents
            .manifest
            .get("collection_info")
            .cloned()
            .and_then(|info| serde_json::from_value(info).ok())
            .unwrap_or_default();

        let mut info = Self {
            version: record.version.clone(),
            updated_at: Some(record.modified.into()),
            artifact: Artifact {
                filename: record.filename.clone(),
                sha256,
                size: record.size,
            },
            collection: CollectionRef {
                name: links.name.to_string(),
                ..CollectionRef::default()
            },
            name: links.name.to_string(),
            namespace: NamespaceRef {
                name: links.namespace.to_string(),
                metadata_sha256: None,
            },
            metadata,
            manifest: contents.manifest,
            files: contents.files,
            ..Self::default()
        };
        info.rewrite_links(links, base);
        info
    }
}

/// Read and decode a cached JSON document.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

// ---------------------------------------------------------------------------
// Archive contents
// ---------------------------------------------------------------------------

/// `MANIFEST.json` and `FILES.json` from a collection archive.
#[derive(Debug, Clone, Default)]
pub struct ArchiveContents {
    pub manifest: Value,
    pub files: Value,
}

/// Pull the two metadata documents out of a `.tar.gz` collection archive.
///
/// Missing members are left as `null`; a corrupt archive is an error.
pub fn read_archive_contents(path: &Path) -> Result<ArchiveContents> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut contents = ArchiveContents::default();

    let entries = archive
        .entries()
        .with_context(|| format!("failed to read archive {}", path.display()))?;
    for entry in entries {
        let mut entry =
            entry.with_context(|| format!("corrupt archive entry in {}", path.display()))?;
        let member = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let slot = match member.as_str() {
            "MANIFEST.json" => &mut contents.manifest,
            "FILES.json" => &mut contents.files,
            _ => continue,
        };
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        *slot = serde_json::from_slice(&buf)
            .with_context(|| format!("invalid {member} in {}", path.display()))?;
        if !contents.manifest.is_null() && !contents.files.is_null() {
            break;
        }
    }
    Ok(contents)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
