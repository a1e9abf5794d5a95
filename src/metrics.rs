//! Maintaining and outputting metrics.
//!
//! Relevant sources for selecting metrics, metric names, and labels:
//! - https://prometheus.io/docs/practices/naming/
//! - https://prometheus.io/docs/instrumenting/writing_exporters/#labels
//! - https://prometheus.io/docs/practices/instrumentation/

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};

use crate::center::Center;

//------------ Module Configuration ------------------------------------------

/// The application prefix to use in the names of Prometheus metrics.
const PROMETHEUS_PREFIX: &str = "interpose";

//------------ MetricsCollection ---------------------------------------------

/// The metrics registry and the gauges refreshed on every scrape.
#[derive(Debug)]
pub struct MetricsCollection {
    registry: Registry,
    state_metrics: StateMetrics,
}

impl MetricsCollection {
    pub fn new() -> Self {
        let mut collection = Self {
            registry: Registry::with_prefix(PROMETHEUS_PREFIX),
            state_metrics: Default::default(),
        };
        collection
            .state_metrics
            .register_metrics(&mut collection.registry);
        collection
    }

    /// Refresh the state-derived gauges and render the exposition text.
    pub fn assemble(&self, center: &Arc<Center>) -> Result<String, fmt::Error> {
        let metrics = &self.state_metrics;

        metrics
            .sessions_active
            .set(center.session_count() as i64);

        let total = center.meters.sessions_total.load(Ordering::Relaxed);
        let counted = metrics.sessions_total.get();
        metrics.sessions_total.inc_by(total.saturating_sub(counted));

        let up = center.meters.bytes_up.load(Ordering::Relaxed);
        metrics
            .bytes_up
            .inc_by(up.saturating_sub(metrics.bytes_up.get()));
        let down = center.meters.bytes_down.load(Ordering::Relaxed);
        metrics
            .bytes_down
            .inc_by(down.saturating_sub(metrics.bytes_down.get()));

        metrics.dns_cache_entries.set(center.dns_cache.len() as i64);
        metrics
            .domain_tree_entries
            .set(center.domain_tree.len() as i64);
        metrics
            .spoofed_certificates
            .set(center.cert_cache.len() as i64);
        metrics
            .whitelist_entries
            .set(center.whitelist.len() as i64);

        let db = center.policy.load();
        metrics.policy_rules.set(db.rules.len() as i64);

        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsCollection {
    fn default() -> Self {
        Self::new()
    }
}

//------------ StateMetrics --------------------------------------------------

#[derive(Debug, Default)]
struct StateMetrics {
    sessions_active: Gauge,
    sessions_total: Counter,
    bytes_up: Counter,
    bytes_down: Counter,
    dns_cache_entries: Gauge,
    domain_tree_entries: Gauge,
    spoofed_certificates: Gauge,
    whitelist_entries: Gauge,
    policy_rules: Gauge,
}

impl StateMetrics {
    pub fn register_metrics(&self, reg: &mut Registry) {
        reg.register(
            "sessions_active",
            "Number of live proxied sessions",
            self.sessions_active.clone(),
        );
        reg.register(
            "sessions",
            "Sessions accepted since startup",
            self.sessions_total.clone(),
        );
        reg.register_with_unit(
            "upload",
            "Bytes moved client-to-origin",
            Unit::Bytes,
            self.bytes_up.clone(),
        );
        reg.register_with_unit(
            "download",
            "Bytes moved origin-to-client",
            Unit::Bytes,
            self.bytes_down.clone(),
        );
        reg.register(
            "dns_cache_entries",
            "Entries in the DNS answer cache",
            self.dns_cache_entries.clone(),
        );
        reg.register(
            "domain_tree_entries",
            "Parent domains in the observed-subdomain tree",
            self.domain_tree_entries.clone(),
        );
        reg.register(
            "spoofed_certificates",
            "Entries in the spoofed certificate cache",
            self.spoofed_certificates.clone(),
        );
        reg.register(
            "whitelist_entries",
            "Live certificate-check override entries",
            self.whitelist_entries.clone(),
        );
        reg.register(
            "policy_rules",
            "Rules in the loaded policy",
            self.policy_rules.clone(),
        );
    }
}
