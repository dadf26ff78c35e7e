//! Ansible Galaxy v3 proxy and local collection server.
//!
//! Each `galaxy` registry either proxies an upstream Galaxy (`url`) or serves
//! collection archives from a directory (`dir`).  Both modes expose the same
//! routes; the registry's configured mode picks the implementation.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    Json,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use url::Url;

use super::handler::{
    AppError, request_base, resolve, resolve_link, upstream_url, validate_path_segment,
    with_cache_status,
};
use super::serve::serve_file;
use crate::AppState;
use crate::cache::digest::digest_of_async;
use crate::cache::local::{VersionSet, list_local_versions_async};
use crate::cache::{CacheKey, Freshness, Resolved, Upstream, is_valid_segment};
use crate::config::GalaxySource;
use crate::registry::galaxy::{
    ApiVersions, Collection, Links, USER_AGENT, VersionInfo, VersionsPage, read_archive_contents,
    read_json,
};

/// Cache file name for the versions listing requested without a query.
const UNQUALIFIED_PAGE: &str = "index";

/// Longest query kept verbatim in a cache file name.
const MAX_QUERY_NAME: usize = 200;

/// Cache file name for one versions page.  Queries are stored as `q.<query>`
/// when that is a safe, short file name and as `h.<sha256>` otherwise, so
/// distinct queries never share a file.
fn versions_page_file(query: &str) -> String {
    if query.is_empty() {
        return UNQUALIFIED_PAGE.to_string();
    }
    let verbatim = format!("q.{query}");
    if query.len() <= MAX_QUERY_NAME && is_valid_segment(&verbatim) {
        verbatim
    } else {
        format!("h.{}", hex::encode(Sha256::digest(query.as_bytes())))
    }
}

// ---------------------------------------------------------------------------
// Registry lookup
// ---------------------------------------------------------------------------

fn source<'a>(state: &'a AppState, key: &str) -> Result<GalaxySource<'a>, AppError> {
    state
        .config
        .galaxy_source(key)
        .ok_or_else(|| AppError::NotFound(format!("unknown galaxy registry {key:?}")))
}

fn links<'a>(key: &'a str, namespace: &'a str, name: &'a str) -> Result<Links<'a>, AppError> {
    validate_path_segment(namespace, "namespace")?;
    validate_path_segment(name, "collection name")?;
    Ok(Links {
        key,
        namespace,
        name,
    })
}

fn json_response<T: Serialize>(doc: &T, resolved: Option<&Resolved>) -> Response {
    let response = (StatusCode::OK, Json(doc)).into_response();
    match resolved {
        Some(resolved) => with_cache_status(response, resolved),
        None => response,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `ANY /galaxy/{key}`: empty body, lets clients probe the server URL.
pub async fn handle_root(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    source(&state, &key)?;
    Ok(StatusCode::OK.into_response())
}

/// `GET /galaxy/{key}/api`
pub async fn handle_api(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    source(&state, &key)?;
    Ok(Json(ApiVersions::default()).into_response())
}

/// `GET /galaxy/{key}/api/v3/collections/{namespace}/{name}/`
#[instrument(skip(state), fields(%key, %namespace, %name))]
pub async fn handle_collection(
    State(state): State<Arc<AppState>>,
    Path((key, namespace, name)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let links = links(&key, &namespace, &name)?;
    match source(&state, &key)? {
        GalaxySource::Proxy(base) => {
            let proxy = Proxy::new(&state, base, links);
            let segments: [&str; 6] = ["api", "v3", "collections", &namespace, &name, ""];
            let (resolved, mut doc) = proxy
                .document::<Collection>(&segments, None, "index.json")
                .await?;
            doc.rewrite_links(&links);
            Ok(json_response(&doc, Some(&resolved)))
        }
        GalaxySource::Local(dir) => {
            let set = local_versions(dir, &links).await?;
            let latest = set.latest()?;
            Ok(json_response(&Collection::from_local(&links, latest), None))
        }
    }
}

/// `GET /galaxy/{key}/api/v3/collections/{namespace}/{name}/versions/`
#[instrument(skip(state), fields(%key, %namespace, %name))]
pub async fn handle_versions(
    State(state): State<Arc<AppState>>,
    Path((key, namespace, name)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response, AppError> {
    let links = links(&key, &namespace, &name)?;
    match source(&state, &key)? {
        GalaxySource::Proxy(base) => {
            let query = query.unwrap_or_default();
            let page_name = versions_page_file(&query);
            let segments: [&str; 7] = ["api", "v3", "collections", &namespace, &name, "versions", ""];
            let proxy = Proxy::new(&state, base, links);
            let (resolved, mut doc) = proxy
                .document::<VersionsPage>(
                    &segments,
                    Some(&query),
                    &format!("versions/index/{page_name}"),
                )
                .await?;
            let page_url = Url::parse(&proxy.url_for(&segments, None)?)
                .map_err(|e| AppError::Internal(e.into()))?;
            doc.rewrite_links(&links, &page_url);
            Ok(json_response(&doc, Some(&resolved)))
        }
        GalaxySource::Local(dir) => {
            let set = local_versions(dir, &links).await?;
            Ok(json_response(&VersionsPage::from_local(&links, &set), None))
        }
    }
}

/// `GET /galaxy/{key}/api/v3/collections/{namespace}/{name}/versions/{version}/`
#[instrument(skip(state, headers), fields(%key, %namespace, %name, %version))]
pub async fn handle_version_info(
    State(state): State<Arc<AppState>>,
    Path((key, namespace, name, version)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let links = links(&key, &namespace, &name)?;
    validate_path_segment(&version, "version")?;
    let base_url = request_base(&headers);

    match source(&state, &key)? {
        GalaxySource::Proxy(base) => {
            let proxy = Proxy::new(&state, base, links);
            let (resolved, mut doc) = proxy.version_info(&version).await?;
            doc.rewrite_links(&links, &base_url);
            Ok(json_response(&doc, Some(&resolved)))
        }
        GalaxySource::Local(dir) => {
            let set = local_versions(dir, &links).await?;
            let record = set.find(&version).ok_or_else(|| {
                AppError::NotFound(format!("{namespace}-{name} {version} not found"))
            })?;

            let archive = record.path.clone();
            let contents = tokio::task::spawn_blocking(move || read_archive_contents(&archive))
                .await
                .context("archive reader task failed")??;
            let sha256 = digest_of_async(&record.path).await?;

            let doc = VersionInfo::from_local(&links, &base_url, record, contents, sha256);
            Ok(json_response(&doc, None))
        }
    }
}

/// `GET /galaxy/{key}/get/{namespace}/{name}/{version}`
#[instrument(skip(state), fields(%key, %namespace, %name, %version))]
pub async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path((key, namespace, name, version)): Path<(String, String, String, String)>,
) -> Result<Response, AppError> {
    let links = links(&key, &namespace, &name)?;
    validate_path_segment(&version, "version")?;
    let archive_name = links.archive_name(&version);

    match source(&state, &key)? {
        GalaxySource::Proxy(base) => {
            let proxy = Proxy::new(&state, base, links);
            let info = proxy.cached_version_info(&version).await?;
            if info.download_url.is_empty() {
                return Err(AppError::BadUpstream(anyhow::anyhow!(
                    "no download_url for {archive_name}"
                )));
            }
            let info_url = proxy.url_for(&proxy.version_segments(&version), None)?;
            let url = resolve_link(&info_url, &info.download_url)?;

            let strategy = match info.artifact.sha256.trim() {
                "" => Freshness::Metadata,
                sha => Freshness::Digest(sha.to_ascii_lowercase()),
            };
            let cache_key = CacheKey::new(
                format!("galaxy/{key}/binary"),
                format!("{namespace}/{name}/{archive_name}"),
            )
            .with_version(version.as_str());
            let upstream = Upstream::new(url).user_agent(USER_AGENT);
            let resolved = resolve(&state, &proxy.registry, &cache_key, &upstream, &strategy).await?;

            Ok(with_cache_status(
                serve_file(&resolved.path, Some(&archive_name)).await?,
                &resolved,
            ))
        }
        GalaxySource::Local(dir) => {
            let set = local_versions(dir, &links).await?;
            let record = set.find(&version).ok_or_else(|| {
                AppError::NotFound(format!("{namespace}-{name} {version} not found"))
            })?;
            serve_file(&record.path, Some(&archive_name)).await
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy mode
// ---------------------------------------------------------------------------

struct Proxy<'a> {
    state: &'a AppState,
    base: &'a str,
    links: Links<'a>,
    registry: String,
}

impl<'a> Proxy<'a> {
    fn new(state: &'a AppState, base: &'a str, links: Links<'a>) -> Self {
        Self {
            state,
            base,
            links,
            registry: format!("galaxy/{}", links.key),
        }
    }

    fn url_for(&self, segments: &[&str], query: Option<&str>) -> Result<String, AppError> {
        upstream_url(self.base, segments, query)
    }

    fn version_segments<'s>(&'s self, version: &'s str) -> [&'s str; 8] {
        [
            "api",
            "v3",
            "collections",
            self.links.namespace,
            self.links.name,
            "versions",
            version,
            "",
        ]
    }

    /// Cache key for an index document under
    /// `galaxy/{key}/index/{namespace}/{name}/`.
    fn index_key(&self, relative: &str) -> CacheKey {
        CacheKey::new(
            format!("galaxy/{}/index", self.links.key),
            format!("{}/{}/{relative}", self.links.namespace, self.links.name),
        )
    }

    /// Refresh an index document (stale copy on failure) and decode it.
    async fn document<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: Option<&str>,
        relative: &str,
    ) -> Result<(Resolved, T), AppError> {
        let upstream = Upstream::new(self.url_for(segments, query)?).user_agent(USER_AGENT);
        let resolved = resolve(
            self.state,
            &self.registry,
            &self.index_key(relative),
            &upstream,
            &Freshness::AlwaysRefresh,
        )
        .await?;
        let doc = read_json(&resolved.path).await.map_err(AppError::BadUpstream)?;
        Ok((resolved, doc))
    }

    async fn version_info(&self, version: &str) -> Result<(Resolved, VersionInfo), AppError> {
        self.document(
            &self.version_segments(version),
            None,
            &format!("versions/{version}/index.json"),
        )
        .await
    }

    /// The cached version document, fetched only when absent or unreadable.
    async fn cached_version_info(&self, version: &str) -> Result<VersionInfo, AppError> {
        let key = self.index_key(&format!("versions/{version}/index.json"));
        let path: PathBuf = self.state.cache.path_for(&key);
        match read_json::<VersionInfo>(&path).await {
            Ok(info) => Ok(info),
            Err(e) => {
                debug!(error = %e, "no usable cached version document");
                Ok(self.version_info(version).await?.1)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Local mode
// ---------------------------------------------------------------------------

/// Index `{dir}/{namespace}/{name}/`; a missing directory is a 404.
async fn local_versions(dir: &FsPath, links: &Links<'_>) -> Result<VersionSet, AppError> {
    let root = dir.join(links.namespace).join(links.name);
    if !tokio::fs::metadata(&root).await.is_ok_and(|m| m.is_dir()) {
        return Err(AppError::NotFound(format!(
            "no collection {}-{}",
            links.namespace, links.name
        )));
    }
    Ok(list_local_versions_async(&root, links.namespace, links.name).await?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::routing::get;
    use serde_json::{Value, json};

    use super::*;
    use crate::cache::digest::digest_of;
    use crate::cache::testing::{spawn_upstream, write_with_mtime};
    use crate::config::{GalaxyEntry, ServerConfig};
    use crate::http::testing::{TestApp, spawn_app};
    use crate::registry::galaxy::tests::write_archive;

    const ARTIFACT: &[u8] = b"collection tarball bytes";

    fn artifact_sha() -> String {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        std::fs::write(&path, ARTIFACT).unwrap();
        digest_of(&path).unwrap()
    }

    async fn proxy_app() -> (TestApp, Arc<AtomicUsize>) {
        let downloads = Arc::new(AtomicUsize::new(0));
        let sha = artifact_sha();
        let base = "/api/v3/collections/community/general";
        let router = Router::new()
            .route(
                &format!("{base}/"),
                get(|| async {
                    Json(json!({
                        "href": "/api/v3/collections/community/general/",
                        "namespace": "community",
                        "name": "general",
                        "versions_url": "/api/v3/collections/community/general/versions/",
                        "highest_version": {"href": "/upstream/", "version": "9.1.0"}
                    }))
                }),
            )
            .route(
                &format!("{base}/versions/"),
                get(|RawQuery(q): RawQuery| async move {
                    Json(json!({
                        "meta": {"count": 2},
                        "links": {
                            "first": format!("/api/v3/collections/community/general/versions/?{}", q.unwrap_or_default()),
                            "previous": null,
                            "next": "/api/v3/collections/community/general/versions/?limit=1&offset=1",
                            "last": "/api/v3/collections/community/general/versions/?limit=1&offset=1"
                        },
                        "data": [{"version": "9.1.0", "href": "/upstream/9.1.0/"}]
                    }))
                }),
            )
            .route(
                &format!("{base}/versions/9.1.0/"),
                get(move || async move {
                    Json(json!({
                        "version": "9.1.0",
                        "href": "/upstream/9.1.0/",
                        "artifact": {"filename": "community-general-9.1.0.tar.gz", "sha256": sha, "size": 24},
                        "collection": {"id": "1", "name": "general", "href": "/upstream/"},
                        "download_url": "/download/community-general-9.1.0.tar.gz",
                        "namespace": {"name": "community"}
                    }))
                }),
            )
            .route(
                "/download/community-general-9.1.0.tar.gz",
                get({
                    let downloads = Arc::clone(&downloads);
                    move || async move {
                        downloads.fetch_add(1, Ordering::SeqCst);
                        ARTIFACT
                    }
                }),
            );
        let upstream = spawn_upstream(router).await;

        let mut server = ServerConfig::default();
        server.galaxy.insert(
            "public".into(),
            GalaxyEntry {
                url: Some(upstream),
                dir: None,
            },
        );
        (spawn_app(server).await, downloads)
    }

    async fn get_json(url: String) -> (reqwest::StatusCode, Option<String>, Value) {
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status();
        let cache = resp
            .headers()
            .get("x-cache-status")
            .map(|v| v.to_str().unwrap().to_string());
        let body = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap_or(Value::Null);
        (status, cache, body)
    }

    #[tokio::test]
    async fn discovery_endpoints() {
        let (app, _) = proxy_app().await;
        let resp = reqwest::get(format!("{}/galaxy/public", app.base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert!(resp.text().await.unwrap().is_empty());

        let (status, _, body) = get_json(format!("{}/galaxy/public/api/", app.base)).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body, json!({"available_versions": {"v3": "v3/"}}));

        let resp = reqwest::get(format!("{}/galaxy/other/api", app.base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn proxied_documents_are_rewritten() {
        let (app, _) = proxy_app().await;
        let prefix = "/galaxy/public/api/v3/collections/community/general/";

        let (status, cache, body) = get_json(format!("{}{prefix}", app.base)).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(cache.as_deref(), Some("MISS"));
        assert_eq!(body["href"], prefix);
        assert_eq!(body["versions_url"], format!("{prefix}versions/"));
        assert_eq!(body["highest_version"]["href"], format!("{prefix}versions/9.1.0/"));

        let (_, _, body) =
            get_json(format!("{}{prefix}versions/?limit=1&offset=0", app.base)).await;
        assert_eq!(body["links"]["first"], format!("{prefix}versions/?limit=1&offset=0"));
        assert_eq!(body["links"]["next"], format!("{prefix}versions/?limit=1&offset=1"));
        assert_eq!(body["links"]["previous"], Value::Null);
        assert_eq!(body["data"][0]["href"], format!("{prefix}versions/9.1.0/"));
        assert!(
            app.cache_dir
                .path()
                .join("galaxy/public/index/community/general/versions/index/q.limit=1&offset=0")
                .is_file()
        );

        let (_, _, body) = get_json(format!("{}{prefix}versions/9.1.0/", app.base)).await;
        assert_eq!(body["href"], format!("{prefix}versions/9.1.0/"));
        assert_eq!(body["collection"]["href"], prefix);
        assert_eq!(
            body["download_url"],
            format!("{}/galaxy/public/get/community/general/9.1.0", app.base)
        );
    }

    #[tokio::test]
    async fn proxied_artifact_digest_cycle() {
        let (app, downloads) = proxy_app().await;
        let url = format!("{}/galaxy/public/get/community/general/9.1.0", app.base);

        let first = reqwest::get(&url).await.unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::OK);
        assert_eq!(first.headers()["x-cache-status"], "MISS");
        assert_eq!(&first.bytes().await.unwrap()[..], ARTIFACT);
        assert!(
            app.cache_dir
                .path()
                .join("galaxy/public/binary/community/general/community-general-9.1.0.tar.gz")
                .is_file()
        );

        let second = reqwest::get(&url).await.unwrap();
        assert_eq!(second.headers()["x-cache-status"], "HIT");
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_mode_serves_directory() {
        let collections = tempfile::tempdir().unwrap();
        let coll = collections.path().join("acme/tools");
        let manifest = json!({"collection_info": {"namespace": "acme", "name": "tools", "version": "1.2.0",
            "dependencies": {"ansible.utils": "*"}}});
        let old = coll.join("acme-tools-1.2.0.tar.gz");
        write_archive(
            &old,
            &[
                ("MANIFEST.json", manifest.to_string().as_bytes()),
                ("FILES.json", br#"{"files": [], "format": 1}"#),
            ],
        );
        filetime::set_file_mtime(&old, filetime::FileTime::from_unix_time(2_000, 0)).unwrap();
        write_with_mtime(&coll.join("acme-tools-1.10.0.tar.gz"), b"newer", 1_000);

        let mut server = ServerConfig::default();
        server.galaxy.insert(
            "internal".into(),
            GalaxyEntry {
                url: None,
                dir: Some(collections.path().to_path_buf()),
            },
        );
        let app = spawn_app(server).await;
        let prefix = format!("{}/galaxy/internal/api/v3/collections/acme/tools/", app.base);

        // Newest modification time wins, not the highest version.
        let (_, cache, body) = get_json(prefix.clone()).await;
        assert_eq!(cache, None);
        assert_eq!(body["highest_version"]["version"], "1.2.0");

        let (_, _, body) = get_json(format!("{prefix}versions/")).await;
        assert_eq!(body["meta"]["count"], 2);

        let (status, _, body) = get_json(format!("{prefix}versions/1.2.0/")).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body["manifest"], manifest);
        assert_eq!(body["metadata"]["dependencies"]["ansible.utils"], "*");
        assert_eq!(body["artifact"]["sha256"], digest_of(&old).unwrap());
        assert_eq!(
            body["download_url"],
            format!("{}/galaxy/internal/get/acme/tools/1.2.0", app.base)
        );

        let resp = reqwest::get(format!("{}/galaxy/internal/get/acme/tools/1.10.0", app.base))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(&resp.bytes().await.unwrap()[..], b"newer");

        let (status, _, _) = get_json(format!("{prefix}versions/3.0.0/")).await;
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
        let (status, _, _) =
            get_json(format!("{}/galaxy/internal/api/v3/collections/acme/absent/", app.base)).await;
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    }

    #[test]
    fn versions_page_files_never_collide() {
        assert_eq!(versions_page_file(""), "index");
        assert_eq!(versions_page_file("_"), "q._");
        assert_eq!(versions_page_file("index"), "q.index");
        assert_eq!(versions_page_file("limit=10&offset=20"), "q.limit=10&offset=20");

        let slashed = versions_page_file("next=/a/b");
        assert!(slashed.starts_with("h.") && is_valid_segment(&slashed));
        let long = versions_page_file(&"x".repeat(400));
        assert_eq!(long.len(), 2 + 64);
        assert_ne!(long, versions_page_file(&"x".repeat(401)));
    }

    #[tokio::test]
    async fn versions_pages_are_cached_per_query() {
        let (app, _) = proxy_app().await;
        let prefix = format!("{}/galaxy/public/api/v3/collections/community/general/versions/", app.base);
        let index = app
            .cache_dir
            .path()
            .join("galaxy/public/index/community/general/versions/index");

        let (status, _, _) = get_json(prefix.clone()).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        let (status, _, body) = get_json(format!("{prefix}?_")).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert!(body["links"]["first"].as_str().unwrap().ends_with("versions/?_"));
        assert!(index.join("index").is_file());
        assert!(index.join("q._").is_file());

        let long_query = format!("offset={}", "9".repeat(300));
        let (status, cache, _) = get_json(format!("{prefix}?{long_query}")).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(cache.as_deref(), Some("MISS"));
        assert_eq!(std::fs::read_dir(&index).unwrap().count(), 3);
    }
}
