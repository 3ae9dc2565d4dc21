use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum GcOutcome {
    Success,
    Failure,
    Skipped,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GcLabels {
    pub task: String,
    pub outcome: GcOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the node.
pub struct Metrics {
    // -- manager --
    pub registrations: Family<OutcomeLabels, Counter>,
    pub keepalive_heartbeats: Counter,
    pub keepalive_stream_failures: Counter,

    // -- dynconfig --
    pub dynconfig_refreshes: Family<OutcomeLabels, Counter>,
    pub dynconfig_fetch_duration_seconds: Histogram,

    // -- gc --
    pub gc_runs: Family<GcLabels, Counter>,

    // -- registry --
    pub peers_listed: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let registrations = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "meshsched_manager_registrations",
            "Registration attempts against the manager by outcome",
            registrations.clone(),
        );

        let keepalive_heartbeats = Counter::default();
        registry.register(
            "meshsched_keepalive_heartbeats",
            "Heartbeats successfully sent to the manager",
            keepalive_heartbeats.clone(),
        );

        let keepalive_stream_failures = Counter::default();
        registry.register(
            "meshsched_keepalive_stream_failures",
            "Keepalive streams that ended with an error",
            keepalive_stream_failures.clone(),
        );

        let dynconfig_refreshes = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "meshsched_dynconfig_refreshes",
            "Dynamic config fetches by outcome",
            dynconfig_refreshes.clone(),
        );

        let dynconfig_fetch_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 12));
        registry.register(
            "meshsched_dynconfig_fetch_duration_seconds",
            "Dynamic config fetch latency in seconds",
            dynconfig_fetch_duration_seconds.clone(),
        );

        let gc_runs = Family::<GcLabels, Counter>::default();
        registry.register(
            "meshsched_gc_runs",
            "GC task triggers by task and outcome",
            gc_runs.clone(),
        );

        let peers_listed: Gauge = Gauge::default();
        registry.register(
            "meshsched_peers_listed",
            "Peers found by the most recent registry scan",
            peers_listed.clone(),
        );

        Self {
            registrations,
            keepalive_heartbeats,
            keepalive_stream_failures,
            dynconfig_refreshes,
            dynconfig_fetch_duration_seconds,
            gc_runs,
            peers_listed,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by every component.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all node metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry.metrics.keepalive_heartbeats.inc();
        registry
            .metrics
            .gc_runs
            .get_or_create(&GcLabels {
                task: "orphaned-cache-files".into(),
                outcome: GcOutcome::Skipped,
            })
            .inc();

        let text = registry.encode().unwrap();
        assert!(text.contains("meshsched_keepalive_heartbeats_total 1"));
        assert!(text.contains("task=\"orphaned-cache-files\""));
        assert!(text.contains("outcome=\"Skipped\""));
    }
}
