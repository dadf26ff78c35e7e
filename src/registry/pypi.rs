//! PyPI simple repository API (PEP 691 JSON in, PEP 503 HTML out).
//!
//! The upstream index is cached verbatim as JSON.  On the way out every file
//! URL is pointed back at this proxy and the page is rendered as the HTML
//! flavour that every installer understands.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// `Accept` value requesting the JSON form of a simple index page.
pub const SIMPLE_JSON_ACCEPT: &str = "application/vnd.pypi.simple.v1+json";

/// User-agent presented to PyPI upstreams.
pub const USER_AGENT: &str = "pypi";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One project page of the simple index.
#[derive(Debug, Clone, Deserialize)]
pub struct SimpleIndex {
    pub name: String,
    #[serde(default)]
    pub files: Vec<SimpleFile>,
}

/// One distribution file listed on a project page.
#[derive(Debug, Clone, Deserialize)]
pub struct SimpleFile {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, rename = "requires-python")]
    pub requires_python: Option<String>,
    #[serde(default)]
    pub yanked: Yanked,
}

/// PEP 592 yank marker: either a flag or a reason string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Yanked {
    Flag(bool),
    Reason(String),
}

impl Default for Yanked {
    fn default() -> Self {
        Yanked::Flag(false)
    }
}

impl Yanked {
    /// Value of the `data-yanked` attribute, if the file is yanked.
    fn attribute(&self) -> Option<&str> {
        match self {
            Yanked::Flag(false) => None,
            Yanked::Flag(true) => Some(""),
            Yanked::Reason(reason) => Some(reason),
        }
    }
}

impl SimpleFile {
    pub fn sha256(&self) -> Option<&str> {
        self.hashes
            .get("sha256")
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }
}

impl SimpleIndex {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("invalid simple index JSON")
    }

    /// Read a cached index document.
    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn find_file(&self, filename: &str) -> Option<&SimpleFile> {
        self.files.iter().find(|f| f.filename == filename)
    }

    /// Point every file URL at `{base}/pypi/{key}/packages/{project}/{filename}`.
    pub fn rewrite_urls(&mut self, base: &str, key: &str, project: &str) {
        for file in &mut self.files {
            file.url = format!("{base}/pypi/{key}/packages/{project}/{}", file.filename);
        }
    }

    /// Render the PEP 503 HTML page.
    pub fn render_html(&self) -> String {
        let name = escape_html(&self.name);
        let mut out = format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head><title>Links for {name}</title>\n  \
             <meta name=\"api-version\" value=\"2\"/>\n</head>\n<body><h1>Links for {name}</h1>\n"
        );

        for file in &self.files {
            let mut href = file.url.clone();
            if let Some(sha) = file.sha256() {
                href.push_str("#sha256=");
                href.push_str(sha);
            }
            out.push_str(&format!("  <a href=\"{}\" rel=\"internal\"", escape_html(&href)));
            if let Some(spec) = file.requires_python.as_deref().filter(|s| !s.is_empty()) {
                out.push_str(&format!(" data-requires-python=\"{}\"", escape_html(spec)));
            }
            if let Some(reason) = file.yanked.attribute() {
                out.push_str(&format!(" data-yanked=\"{}\"", escape_html(reason)));
            }
            out.push_str(&format!(">{}</a><br/>\n", escape_html(&file.filename)));
        }

        out.push_str("</body>\n</html>\n");
        out
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
