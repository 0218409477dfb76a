//! Prometheus exposition
//!
//! Mirrors broker and registry statistics into a private prometheus registry.
//! Values are refreshed from snapshots right before each scrape: sizes are
//! gauges, running totals are counters advanced to the snapshot value.

use crate::broker::{BrokerStatsSnapshot, VerbStats};
use crate::error::{Error, Result};
use crate::registry::RegistryStatsSnapshot;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Broker metrics
pub struct BrokerMetrics {
    registry: Registry,
    instances: IntGauge,
    bindings: IntGauge,
    flushes: IntCounter,
    flush_failures: IntCounter,
    conflicts: IntCounter,
    requests: IntCounterVec,
}

impl BrokerMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let instances = IntGauge::new("nfsbroker_instances", "Service instances recorded")
            .map_err(metrics_error)?;
        let bindings = IntGauge::new("nfsbroker_bindings", "Service bindings recorded")
            .map_err(metrics_error)?;
        let flushes = IntCounter::new(
            "nfsbroker_state_flushes_total",
            "Successful registry flushes since start",
        )
        .map_err(metrics_error)?;
        let flush_failures = IntCounter::new(
            "nfsbroker_state_flush_failures_total",
            "Failed registry flushes since start",
        )
        .map_err(metrics_error)?;
        let conflicts = IntCounter::new(
            "nfsbroker_conflicts_total",
            "Create requests rejected for differing details",
        )
        .map_err(metrics_error)?;
        let requests = IntCounterVec::new(
            Opts::new("nfsbroker_requests_total", "Broker requests by verb and outcome"),
            &["verb", "outcome"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(instances.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(bindings.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(flushes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(flush_failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(conflicts.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(requests.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            instances,
            bindings,
            flushes,
            flush_failures,
            conflicts,
            requests,
        })
    }

    /// Copy snapshot values into the metrics
    pub fn observe(&self, broker: &BrokerStatsSnapshot, registry: &RegistryStatsSnapshot) {
        self.instances.set(registry.instances as i64);
        self.bindings.set(registry.bindings as i64);
        advance(&self.flushes, registry.flushes);
        advance(&self.flush_failures, registry.flush_failures);
        advance(&self.conflicts, registry.conflicts);

        self.observe_verb("provision", &broker.provision);
        self.observe_verb("deprovision", &broker.deprovision);
        self.observe_verb("bind", &broker.bind);
        self.observe_verb("unbind", &broker.unbind);
    }

    fn observe_verb(&self, verb: &str, stats: &VerbStats) {
        advance(
            &self.requests.with_label_values(&[verb, "succeeded"]),
            stats.succeeded,
        );
        advance(
            &self.requests.with_label_values(&[verb, "failed"]),
            stats.failed,
        );
    }

    /// Content type of [`render`](Self::render) output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Render in prometheus text format
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

/// Move a counter up to `total`; counters never go down
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
