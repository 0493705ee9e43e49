//! Shared test infrastructure for discovery integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use router_api::{
    DiscoveryConfig, InstanceAddress, ServiceInstanceRecord, TagFilterConfig, TagFilterMode, TagSet,
};
use router_core::{
    Discovery, Endpoint, HostLookup, HostLookupAnswer, InMemoryRegistry, LookupError, PushError,
    SnapshotDiff, SnapshotSink,
};

// --- Constants ---

pub const SERVICE: &str = "my-svc";
pub const CONSUL_HOST: &str = "my-svc.service.dc1.consul";
pub const OTHER_HOST: &str = "my-svc.service.dc2.consul";
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(100);
pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);
pub const EVENTUALLY_POLL: Duration = Duration::from_millis(20);

// --- Bounded polling ---

/// Poll `check` until it holds, panicking after [`EVENTUALLY_TIMEOUT`].
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}: {}", EVENTUALLY_TIMEOUT, what);
        }
        tokio::time::sleep(EVENTUALLY_POLL).await;
    }
}

/// [`eventually`] for checks that need to await.
pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}: {}", EVENTUALLY_TIMEOUT, what);
        }
        tokio::time::sleep(EVENTUALLY_POLL).await;
    }
}

// --- ScriptedLookup ---

/// Hostname lookups answered from a table that tests rewrite while
/// discovery runs. Unknown hosts get an empty answer; hung hosts never
/// answer at all.
#[derive(Default)]
pub struct ScriptedLookup {
    answers: Mutex<HashMap<String, Result<Vec<IpAddr>, String>>>,
    hung: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedLookup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, host: &str, ips: &[&str]) {
        let ips = ips.iter().map(|ip| ip.parse().expect("bad test ip")).collect();
        self.answers.lock().unwrap().insert(host.to_string(), Ok(ips));
    }

    pub fn fail(&self, host: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(host.to_string(), Err("SERVFAIL".to_string()));
    }

    /// Lookups of `host` block until the caller gives up.
    pub fn hang(&self, host: &str) {
        self.hung.lock().unwrap().insert(host.to_string());
    }

    pub fn calls(&self, host: &str) -> usize {
        self.calls.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HostLookup for ScriptedLookup {
    async fn lookup(&self, host: &str) -> Result<HostLookupAnswer, LookupError> {
        *self.calls.lock().unwrap().entry(host.to_string()).or_default() += 1;
        let hung = self.hung.lock().unwrap().contains(host);
        if hung {
            std::future::pending::<()>().await;
        }
        let answer = self.answers.lock().unwrap().get(host).cloned();
        match answer {
            Some(Ok(ips)) => Ok(HostLookupAnswer::new(ips, None)),
            Some(Err(reason)) => Err(LookupError::Failed {
                host: host.to_string(),
                reason,
            }),
            None => Ok(HostLookupAnswer::default()),
        }
    }
}

// --- RecordingSink ---

/// Snapshot sink that records delivered diffs and can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<SnapshotDiff>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject the next `n` pushes.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<SnapshotDiff> {
        self.delivered.lock().unwrap().clone()
    }

    /// Endpoints of a service, replayed from every delivered diff.
    pub fn replayed_endpoints(&self, service: &str) -> Vec<Endpoint> {
        let mut endpoints = std::collections::BTreeSet::new();
        for diff in self.delivered.lock().unwrap().iter() {
            for bucket in diff.buckets.iter().filter(|b| b.key.service_name == service) {
                for removed in &bucket.removed {
                    endpoints.remove(removed);
                }
                for added in &bucket.added {
                    endpoints.insert(added.endpoint);
                }
            }
        }
        endpoints.into_iter().collect()
    }
}

#[async_trait]
impl SnapshotSink for RecordingSink {
    async fn push(&self, diff: &SnapshotDiff) -> Result<(), PushError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(PushError::Rejected(503));
        }
        self.delivered.lock().unwrap().push(diff.clone());
        Ok(())
    }
}

// --- Config and records ---

pub fn tags(list: &[&str]) -> TagSet {
    list.iter().copied().collect()
}

/// Configuration with intervals short enough for tests.
pub fn fast_config(services: &[&str], allowlist: &[&str], mode: TagFilterMode) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::default();
    config.registry.services = services.iter().map(|s| s.to_string()).collect();
    config.registry.request_timeout_ms = 1_000;
    config.registry.wait_seconds = 0;
    config.registry.backoff.initial_ms = 10;
    config.registry.backoff.max_ms = 100;
    config.filter = TagFilterConfig::new(tags(allowlist)).with_mode(mode);
    config.resolver.refresh_interval_ms = REFRESH_INTERVAL.as_millis() as u64;
    config.resolver.ttl_floor_ms = 20;
    config.resolver.lookup_timeout_ms = 200;
    config.resolver.backoff.initial_ms = 10;
    config.resolver.backoff.max_ms = 50;
    config.publisher.backoff.initial_ms = 10;
    config.publisher.backoff.max_ms = 50;
    config
}

pub fn registry() -> InMemoryRegistry {
    InMemoryRegistry::with_wait(Duration::from_millis(200))
}

pub fn ip_record(id: &str, tag_list: &[&str], ip: &str, port: u16) -> ServiceInstanceRecord {
    ServiceInstanceRecord::new(
        SERVICE,
        id,
        InstanceAddress::Ip(ip.parse().expect("bad test ip")),
        port,
    )
    .with_tags(tag_list.iter().copied())
}

pub fn host_record(id: &str, tag_list: &[&str], host: &str, port: u16) -> ServiceInstanceRecord {
    ServiceInstanceRecord::new(SERVICE, id, InstanceAddress::Hostname(host.to_string()), port)
        .with_tags(tag_list.iter().copied())
}

pub fn endpoints(list: &[&str]) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = list
        .iter()
        .map(|e| e.parse::<std::net::SocketAddr>().expect("bad test endpoint").into())
        .collect();
    endpoints.sort();
    endpoints
}

pub fn start(config: DiscoveryConfig, registry: &InMemoryRegistry, lookup: Arc<ScriptedLookup>) -> Discovery {
    Discovery::builder(config)
        .registry(Arc::new(registry.clone()))
        .lookup(lookup)
        .start()
        .expect("discovery failed to start")
}

pub fn start_with_sink(
    config: DiscoveryConfig,
    registry: &InMemoryRegistry,
    lookup: Arc<ScriptedLookup>,
    sink: Arc<RecordingSink>,
) -> Discovery {
    Discovery::builder(config)
        .registry(Arc::new(registry.clone()))
        .lookup(lookup)
        .sink(sink)
        .start()
        .expect("discovery failed to start")
}
