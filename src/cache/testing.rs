//! In-process upstream and fixtures shared by cache tests.

use std::path::{Path, PathBuf};

use axum::Router;

/// Serve `router` on an ephemeral loopback port and return its base URL.
pub(crate) async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test upstream");
    let addr = listener.local_addr().expect("test upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test upstream");
    });
    format!("http://{addr}")
}

pub(crate) fn client() -> reqwest::Client {
    reqwest::Client::new()
}

/// Format a unix timestamp as an HTTP-date.
pub(crate) fn http_date(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .expect("valid timestamp")
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Leftover `.tmp.*` files directly under `dir`.
pub(crate) fn temp_files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with(".tmp."))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Write `content` to `path` and pin its modification time.
pub(crate) fn write_with_mtime(path: &Path, content: &[u8], mtime_secs: i64) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture dir");
    }
    std::fs::write(path, content).expect("write fixture");
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime_secs, 0))
        .expect("set fixture mtime");
}
