use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cache::is_valid_segment;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory of the on-disk cache.
    pub dir: PathBuf,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// User-agent for static mirror requests.  Registry requests identify
    /// as their native clients.
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_listen() -> String {
    "0.0.0.0:6587".to_string()
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Registry instances keyed by the name used in request paths.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// PyPI simple-index base URLs (e.g. `https://pypi.org/simple`).
    #[serde(default)]
    pub pypi: BTreeMap<String, String>,
    /// Plain HTTP mirror base URLs.
    #[serde(default, rename = "static")]
    pub static_files: BTreeMap<String, String>,
    #[serde(default)]
    pub galaxy: BTreeMap<String, GalaxyEntry>,
}

/// One Galaxy registry: either a proxied upstream or a local directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GalaxyEntry {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Resolved mode of a [`GalaxyEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalaxySource<'a> {
    Proxy(&'a str),
    Local(&'a Path),
}

impl GalaxyEntry {
    /// The configured mode, or `None` unless exactly one of `url` / `dir` is
    /// set.
    pub fn source(&self) -> Option<GalaxySource<'_>> {
        match (&self.url, &self.dir) {
            (Some(url), None) => Some(GalaxySource::Proxy(trim_base(url))),
            (None, Some(dir)) => Some(GalaxySource::Local(dir)),
            _ => None,
        }
    }
}

impl Config {
    pub fn pypi_upstream(&self, key: &str) -> Option<&str> {
        self.server.pypi.get(key).map(|u| trim_base(u))
    }

    pub fn static_upstream(&self, key: &str) -> Option<&str> {
        self.server.static_files.get(key).map(|u| trim_base(u))
    }

    pub fn galaxy_source(&self, key: &str) -> Option<GalaxySource<'_>> {
        self.server.galaxy.get(key).and_then(GalaxyEntry::source)
    }
}

/// Base URLs are joined with `/`, so a trailing slash would double up.
fn trim_base(url: &str) -> &str {
    url.trim_end_matches('/')
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.dir.as_os_str().is_empty(),
        "cache dir must not be empty"
    );
    if let Some(ua) = &config.user_agent {
        anyhow::ensure!(
            reqwest::header::HeaderValue::from_str(ua).is_ok(),
            "user_agent {ua:?} is not a valid header value"
        );
    }

    let keys = config
        .server
        .pypi
        .keys()
        .map(|k| ("pypi", k))
        .chain(config.server.static_files.keys().map(|k| ("static", k)))
        .chain(config.server.galaxy.keys().map(|k| ("galaxy", k)));
    for (registry, key) in keys {
        anyhow::ensure!(
            is_valid_segment(key),
            "invalid {registry} registry key {key:?}: must be a single path segment"
        );
    }

    for (key, entry) in &config.server.galaxy {
        match (&entry.url, &entry.dir) {
            (Some(_), Some(_)) => {
                anyhow::bail!("galaxy registry {key:?}: url and dir are mutually exclusive")
            }
            (None, None) => anyhow::bail!("galaxy registry {key:?}: one of url or dir is required"),
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
