//! Prometheus metrics for the discovery pipeline

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for discovery. Clones share one registry.
#[derive(Clone)]
pub struct DiscoveryMetrics {
    /// Watch events processed, by kind (added/updated/removed)
    pub watch_events_total: IntCounterVec,
    /// Registry records dropped because they lacked an address or port
    pub malformed_records_total: IntCounter,
    /// Failed registry requests
    pub registry_errors_total: IntCounter,
    /// 1 while the registry is unreachable
    pub registry_degraded: IntGauge,
    /// Hostname lookups, by result (ok/empty/error/timeout)
    pub dns_lookups_total: IntCounterVec,
    /// Hostnames currently served from a stale answer
    pub stale_hostnames: IntGauge,
    /// Hostnames currently tracked by the resolver
    pub tracked_hostnames: IntGauge,
    /// Version of the current snapshot
    pub snapshot_version: IntGauge,
    /// Snapshots published (non-empty diffs)
    pub snapshots_published_total: IntCounter,
    /// Endpoints in the current snapshot
    pub snapshot_endpoints: IntGauge,
    /// Failed downstream push attempts
    pub push_failures_total: IntCounter,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl DiscoveryMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let watch_events_total = IntCounterVec::new(
            Opts::new("discovery_watch_events_total", "Registry watch events processed"),
            &["kind"],
        )?;
        let malformed_records_total = IntCounter::new(
            "discovery_malformed_records_total",
            "Registry records dropped as malformed",
        )?;
        let registry_errors_total = IntCounter::new(
            "discovery_registry_errors_total",
            "Failed registry requests",
        )?;
        let registry_degraded = IntGauge::new(
            "discovery_registry_degraded",
            "Whether the registry is currently unreachable",
        )?;
        let dns_lookups_total = IntCounterVec::new(
            Opts::new("discovery_dns_lookups_total", "Hostname lookups by result"),
            &["result"],
        )?;
        let stale_hostnames = IntGauge::new(
            "discovery_stale_hostnames",
            "Hostnames served from a stale answer",
        )?;
        let tracked_hostnames = IntGauge::new(
            "discovery_tracked_hostnames",
            "Hostnames tracked by the resolver",
        )?;
        let snapshot_version = IntGauge::new(
            "discovery_snapshot_version",
            "Version of the current discovery snapshot",
        )?;
        let snapshots_published_total = IntCounter::new(
            "discovery_snapshots_published_total",
            "Snapshots published",
        )?;
        let snapshot_endpoints = IntGauge::new(
            "discovery_snapshot_endpoints",
            "Endpoints in the current snapshot",
        )?;
        let push_failures_total = IntCounter::new(
            "discovery_push_failures_total",
            "Failed downstream push attempts",
        )?;

        registry.register(Box::new(watch_events_total.clone()))?;
        registry.register(Box::new(malformed_records_total.clone()))?;
        registry.register(Box::new(registry_errors_total.clone()))?;
        registry.register(Box::new(registry_degraded.clone()))?;
        registry.register(Box::new(dns_lookups_total.clone()))?;
        registry.register(Box::new(stale_hostnames.clone()))?;
        registry.register(Box::new(tracked_hostnames.clone()))?;
        registry.register(Box::new(snapshot_version.clone()))?;
        registry.register(Box::new(snapshots_published_total.clone()))?;
        registry.register(Box::new(snapshot_endpoints.clone()))?;
        registry.register(Box::new(push_failures_total.clone()))?;

        Ok(Self {
            watch_events_total,
            malformed_records_total,
            registry_errors_total,
            registry_degraded,
            dns_lookups_total,
            stale_hostnames,
            tracked_hostnames,
            snapshot_version,
            snapshots_published_total,
            snapshot_endpoints,
            push_failures_total,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
