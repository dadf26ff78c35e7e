//! A running proxy instance for route-level tests.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use crate::AppState;
use crate::cache::testing::{client, spawn_upstream};
use crate::config::{Config, ServerConfig};

pub(crate) struct TestApp {
    /// Base URL of the proxy, e.g. `http://127.0.0.1:41234`.
    pub base: String,
    pub cache_dir: TempDir,
}

/// Start the proxy on an ephemeral port with a fresh cache directory.
pub(crate) async fn spawn_app(server: ServerConfig) -> TestApp {
    spawn_app_with(server, None).await
}

pub(crate) async fn spawn_app_with(server: ServerConfig, user_agent: Option<&str>) -> TestApp {
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let config = Config {
        dir: PathBuf::from(cache_dir.path()),
        listen: "127.0.0.1:0".into(),
        user_agent: user_agent.map(str::to_owned),
        server,
    };
    let state = Arc::new(AppState::new(config, client()));
    let base = spawn_upstream(crate::http::handler::create_router(state)).await;
    TestApp { base, cache_dir }
}
