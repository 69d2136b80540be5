//! # Prometheus metrics exposition
//!
//! Operational metrics for an API instance, scraped at `/metrics`.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `xrfcore_ws_sessions` | Gauge | — | Open sessions on this instance |
//! | `xrfcore_active_jobs` | Gauge | — | Jobs this instance is watching |
//! | `xrfcore_cache_resident_bytes` | Gauge | — | File cache resident size |
//! | `xrfcore_quant_jobs_total` | Counter | `command` | Quantifications started |
//! | `xrfcore_notifications_total` | Counter | — | Per-user notifications routed |
//!
//! Gauges are refreshed by the gateway's background loop; counters are
//! bumped at the call sites.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Label set for per-command quant counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct CommandLabel {
    pub command: String,
}

pub struct Metrics {
    pub registry: Registry,
    pub ws_sessions: Gauge,
    pub active_jobs: Gauge,
    pub cache_resident_bytes: Gauge,
    pub quant_jobs: Family<CommandLabel, Counter>,
    pub notifications: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let ws_sessions = Gauge::default();
        registry.register(
            "xrfcore_ws_sessions",
            "Number of open sessions on this instance",
            ws_sessions.clone(),
        );

        let active_jobs = Gauge::default();
        registry.register(
            "xrfcore_active_jobs",
            "Number of jobs this instance is watching",
            active_jobs.clone(),
        );

        let cache_resident_bytes = Gauge::default();
        registry.register(
            "xrfcore_cache_resident_bytes",
            "Resident size of the local file cache",
            cache_resident_bytes.clone(),
        );

        let quant_jobs = Family::<CommandLabel, Counter>::default();
        registry.register(
            "xrfcore_quant_jobs",
            "Quantification runs started, by command",
            quant_jobs.clone(),
        );

        let notifications = Counter::default();
        registry.register(
            "xrfcore_notifications",
            "Per-user notifications routed",
            notifications.clone(),
        );

        Self {
            registry,
            ws_sessions,
            active_jobs,
            cache_resident_bytes,
            quant_jobs,
            notifications,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
