use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::cache::Resolved;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Registry instance, e.g. `pypi/main`.
    pub registry: String,
    pub cache_status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    /// `ok` or the error kind of the failed fetch.
    pub outcome: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub upstream_fetches_total: Family<FetchLabels, Counter>,
    pub upstream_fetch_bytes_total: Counter,
    pub upstream_fetch_duration_seconds: Histogram,
    pub stale_served_total: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "pkghub_requests",
            "Artifact and index requests by registry and cache status",
            requests_total.clone(),
        );

        let upstream_fetches_total = Family::<FetchLabels, Counter>::default();
        registry.register(
            "pkghub_upstream_fetches",
            "Upstream fetches by outcome",
            upstream_fetches_total.clone(),
        );

        let upstream_fetch_bytes_total = Counter::default();
        registry.register(
            "pkghub_upstream_fetch_bytes",
            "Bytes written to the cache from upstream",
            upstream_fetch_bytes_total.clone(),
        );

        let upstream_fetch_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "pkghub_upstream_fetch_duration_seconds",
            "Upstream fetch latency in seconds",
            upstream_fetch_duration_seconds.clone(),
        );

        let stale_served_total = Counter::default();
        registry.register(
            "pkghub_stale_served",
            "Responses served from a stale copy after a failed refresh",
            stale_served_total.clone(),
        );

        Self {
            requests_total,
            upstream_fetches_total,
            upstream_fetch_bytes_total,
            upstream_fetch_duration_seconds,
            stale_served_total,
        }
    }

    /// Account for one resolved request against `registry`.
    pub fn record_resolved(&self, registry: &str, resolved: &Resolved) {
        self.requests_total
            .get_or_create(&RequestLabels {
                registry: registry.to_string(),
                cache_status: resolved.cache_status().to_string(),
            })
            .inc();

        if let Some(elapsed) = resolved.fetch_elapsed {
            self.record_fetch(resolved.fetch_error.unwrap_or("ok"), Some(elapsed));
        }
        if let Some(bytes) = resolved.fetched_bytes {
            self.upstream_fetch_bytes_total.inc_by(bytes);
        }
        if resolved.stale {
            self.stale_served_total.inc();
        }
    }

    /// Count one upstream fetch and, when timed, its latency.
    pub fn record_fetch(&self, outcome: &str, elapsed: Option<Duration>) {
        self.upstream_fetches_total
            .get_or_create(&FetchLabels {
                outcome: outcome.to_string(),
            })
            .inc();
        if let Some(elapsed) = elapsed {
            self.upstream_fetch_duration_seconds
                .observe(elapsed.as_secs_f64());
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition of the registry.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::cache::Verdict;

    fn resolved(verdict: Verdict, stale: bool, bytes: Option<u64>) -> Resolved {
        Resolved {
            path: PathBuf::from("/c/x"),
            verdict,
            stale,
            fetched_bytes: bytes,
            fetch_elapsed: (verdict != Verdict::Hit).then_some(Duration::from_millis(20)),
            fetch_error: stale.then_some("transport_error"),
        }
    }

    #[test]
    fn records_requests_and_fetches() {
        let registry = MetricsRegistry::new();
        let m = &registry.metrics;
        m.record_resolved("pypi/main", &resolved(Verdict::Missing, false, Some(100)));
        m.record_resolved("pypi/main", &resolved(Verdict::Hit, false, None));
        m.record_resolved("pypi/main", &resolved(Verdict::Expired, true, None));

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"pkghub_requests_total{registry="pypi/main",cache_status="MISS"} 1"#));
        assert!(text.contains(r#"pkghub_requests_total{registry="pypi/main",cache_status="HIT"} 1"#));
        assert!(text.contains(r#"pkghub_requests_total{registry="pypi/main",cache_status="STALE"} 1"#));
        assert!(text.contains(r#"pkghub_upstream_fetches_total{outcome="ok"} 1"#));
        assert!(text.contains(r#"pkghub_upstream_fetches_total{outcome="transport_error"} 1"#));
        assert!(text.contains("pkghub_upstream_fetch_bytes_total 100"));
        assert!(text.contains("pkghub_stale_served_total 1"));
        assert!(text.contains("pkghub_upstream_fetch_duration_seconds_count 2"));
    }
}
