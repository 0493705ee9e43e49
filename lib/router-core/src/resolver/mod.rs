//! Endpoint resolution for instance addresses
//!
//! IP literals resolve on the spot. Hostnames are refreshed by one
//! background task each, on their own TTL-driven schedule; answers flow
//! back to the owner of the [`EndpointResolver`] as [`HostUpdate`]s and are
//! cached here, keyed by hostname.

mod lookup;

pub use lookup::{HickoryLookup, HostLookup, HostLookupAnswer};

use crate::backoff::Backoff;
use crate::endpoint::{Endpoint, ResolvedEndpoint};
use crate::error::LookupError;
use crate::metrics::DiscoveryMetrics;
use chrono::{DateTime, Utc};
use router_api::{InstanceAddress, ResolverConfig};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of resolving one instance address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Vec<ResolvedEndpoint>),
    /// Hostname without any answer yet.
    Pending,
}

impl Resolution {
    pub fn endpoints(&self) -> &[ResolvedEndpoint] {
        match self {
            Resolution::Resolved(endpoints) => endpoints,
            Resolution::Pending => &[],
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Resolution::Pending)
    }
}

/// Fresh answer for a hostname, produced by its refresh task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostUpdate {
    pub hostname: String,
    /// Monotonic across all refresh tasks; older updates are ignored.
    pub sequence: u64,
    /// Refresh task that produced the update. Updates from a task that was
    /// replaced for the same hostname are ignored.
    pub generation: u64,
    pub ips: Vec<IpAddr>,
    pub ttl: Duration,
    pub resolved_at: DateTime<Utc>,
    /// The last lookup failed and `ips` is the last known good answer.
    pub stale: bool,
}

struct HostEntry {
    generation: u64,
    answer: Option<HostUpdate>,
    last_sequence: u64,
    owners: BTreeSet<String>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the hostname cache and of the per-hostname refresh tasks.
pub struct EndpointResolver {
    config: ResolverConfig,
    lookup: Arc<dyn HostLookup>,
    updates: mpsc::Sender<HostUpdate>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    sequence: Arc<AtomicU64>,
    generation: u64,
    metrics: DiscoveryMetrics,
    hosts: HashMap<String, HostEntry>,
    // instance id -> hostname it references
    interests: HashMap<String, String>,
}

impl EndpointResolver {
    pub fn new(
        config: ResolverConfig,
        lookup: Arc<dyn HostLookup>,
        updates: mpsc::Sender<HostUpdate>,
        cancel: &CancellationToken,
        metrics: DiscoveryMetrics,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_lookups.max(1)));
        Self {
            config,
            lookup,
            updates,
            cancel: cancel.child_token(),
            permits,
            sequence: Arc::new(AtomicU64::new(0)),
            generation: 0,
            metrics,
            hosts: HashMap::new(),
            interests: HashMap::new(),
        }
    }

    /// Endpoints for an instance address. Hostnames start being refreshed on
    /// first reference and answer from the cache, `Pending` until the first
    /// lookup completes.
    pub fn resolve(&mut self, instance_id: &str, address: &InstanceAddress, port: u16) -> Resolution {
        match address {
            InstanceAddress::Ip(ip) => {
                self.release(instance_id);
                Resolution::Resolved(vec![ResolvedEndpoint {
                    endpoint: Endpoint::new(*ip, port),
                    instance_id: instance_id.to_string(),
                    resolved_at: Utc::now(),
                    ttl: self.config.refresh_interval(),
                    stale: false,
                }])
            }
            InstanceAddress::Hostname(host) => {
                if self.interests.get(instance_id).is_some_and(|h| h != host) {
                    self.release(instance_id);
                }
                self.interests.insert(instance_id.to_string(), host.clone());
                if !self.hosts.contains_key(host) {
                    let entry = self.spawn_refresh(host);
                    self.hosts.insert(host.clone(), entry);
                    self.metrics.tracked_hostnames.set(self.hosts.len() as i64);
                }

                let Some(entry) = self.hosts.get_mut(host) else {
                    return Resolution::Pending;
                };
                entry.owners.insert(instance_id.to_string());
                match &entry.answer {
                    Some(answer) => Resolution::Resolved(endpoints_from(answer, instance_id, port)),
                    None => Resolution::Pending,
                }
            }
        }
    }

    /// Record a refresh result. Returns the instances whose endpoints need
    /// recomputing; empty when the update is outdated or its hostname is no
    /// longer referenced.
    pub fn apply(&mut self, update: HostUpdate) -> Vec<String> {
        let Some(entry) = self.hosts.get_mut(&update.hostname) else {
            debug!(hostname = %update.hostname, "Ignoring update for released hostname");
            return Vec::new();
        };
        if update.generation != entry.generation {
            debug!(
                hostname = %update.hostname,
                generation = update.generation,
                "Ignoring update from a replaced refresh task"
            );
            return Vec::new();
        }
        if update.sequence <= entry.last_sequence {
            debug!(
                hostname = %update.hostname,
                sequence = update.sequence,
                "Ignoring outdated hostname update"
            );
            return Vec::new();
        }

        entry.last_sequence = update.sequence;
        entry.answer = Some(update);
        let owners = entry.owners.iter().cloned().collect();
        self.refresh_gauges();
        owners
    }

    /// Drop an instance's interest in its hostname. The refresh task stops
    /// and the cache entry goes once no instance references the hostname.
    pub fn release(&mut self, instance_id: &str) {
        let Some(host) = self.interests.remove(instance_id) else {
            return;
        };
        let unused = match self.hosts.get_mut(&host) {
            Some(entry) => {
                entry.owners.remove(instance_id);
                entry.owners.is_empty()
            }
            None => false,
        };
        if unused {
            if let Some(entry) = self.hosts.remove(&host) {
                entry.cancel.cancel();
                debug!(hostname = %host, "Stopped refreshing hostname");
            }
            self.refresh_gauges();
        }
    }

    /// Cached answer for a hostname, if any.
    pub fn cached(&self, hostname: &str) -> Option<&HostUpdate> {
        self.hosts.get(hostname).and_then(|entry| entry.answer.as_ref())
    }

    pub fn tracked_hostnames(&self) -> usize {
        self.hosts.len()
    }

    /// Stop every refresh task and wait for them to exit.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.interests.clear();
        let handles: Vec<JoinHandle<()>> = self.hosts.drain().map(|(_, entry)| entry.handle).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.refresh_gauges();
    }

    fn spawn_refresh(&mut self, hostname: &str) -> HostEntry {
        self.generation += 1;
        let cancel = self.cancel.child_token();
        let task = RefreshTask {
            hostname: hostname.to_string(),
            generation: self.generation,
            config: self.config.clone(),
            lookup: Arc::clone(&self.lookup),
            permits: Arc::clone(&self.permits),
            sequence: Arc::clone(&self.sequence),
            updates: self.updates.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
        };
        debug!(hostname = %hostname, "Started refreshing hostname");
        HostEntry {
            generation: self.generation,
            answer: None,
            last_sequence: self.sequence.load(Ordering::SeqCst),
            owners: BTreeSet::new(),
            cancel,
            handle: tokio::spawn(task.run()),
        }
    }

    fn refresh_gauges(&self) {
        let stale = self
            .hosts
            .values()
            .filter(|entry| entry.answer.as_ref().is_some_and(|a| a.stale))
            .count();
        self.metrics.stale_hostnames.set(stale as i64);
        self.metrics.tracked_hostnames.set(self.hosts.len() as i64);
    }
}

fn endpoints_from(answer: &HostUpdate, instance_id: &str, port: u16) -> Vec<ResolvedEndpoint> {
    answer
        .ips
        .iter()
        .map(|ip| ResolvedEndpoint {
            endpoint: Endpoint::new(*ip, port),
            instance_id: instance_id.to_string(),
            resolved_at: answer.resolved_at,
            ttl: answer.ttl,
            stale: answer.stale,
        })
        .collect()
}

/// Refresh loop for one hostname.
struct RefreshTask {
    hostname: String,
    generation: u64,
    config: ResolverConfig,
    lookup: Arc<dyn HostLookup>,
    permits: Arc<Semaphore>,
    sequence: Arc<AtomicU64>,
    updates: mpsc::Sender<HostUpdate>,
    metrics: DiscoveryMetrics,
    cancel: CancellationToken,
}

impl RefreshTask {
    async fn run(self) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut last: Option<HostUpdate> = None;

        loop {
            let delay = match self.lookup_once().await {
                None => return,
                Some(Ok(answer)) => {
                    backoff.reset();
                    let ttl = self.cache_ttl(answer.ttl);
                    let mut ips = answer.ips;
                    ips.sort();
                    ips.dedup();

                    let changed = last.as_ref().map_or(true, |prev| prev.stale || prev.ips != ips);
                    if changed {
                        debug!(hostname = %self.hostname, ips = ?ips, "Hostname resolved");
                        let update = self.update(ips, ttl, Utc::now(), false);
                        last = Some(update.clone());
                        if !self.send(update).await {
                            return;
                        }
                    }
                    ttl
                }
                Some(Err(e)) => {
                    warn!(hostname = %self.hostname, error = %e, "Hostname lookup failed");
                    if let Some(prev) = last.as_ref().filter(|prev| !prev.stale) {
                        let update = self.update(prev.ips.clone(), prev.ttl, prev.resolved_at, true);
                        last = Some(update.clone());
                        if !self.send(update).await {
                            return;
                        }
                    }
                    backoff.next_delay().min(self.config.refresh_interval())
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One bounded lookup. `None` when cancelled.
    async fn lookup_once(&self) -> Option<Result<HostLookupAnswer, LookupError>> {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            permit = self.permits.acquire() => permit.ok()?,
        };

        let timeout = self.config.lookup_timeout();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            result = tokio::time::timeout(timeout, self.lookup.lookup(&self.hostname)) => result,
        };
        let result = result.unwrap_or_else(|_| {
            Err(LookupError::Timeout {
                host: self.hostname.clone(),
                timeout,
            })
        });

        let label = match &result {
            Ok(answer) if answer.ips.is_empty() => "empty",
            Ok(_) => "ok",
            Err(LookupError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        self.metrics.dns_lookups_total.with_label_values(&[label]).inc();
        Some(result)
    }

    /// Record TTL, or the refresh interval when unknown, clamped to
    /// `[ttl_floor, refresh_interval]`.
    fn cache_ttl(&self, ttl: Option<Duration>) -> Duration {
        let interval = self.config.refresh_interval();
        ttl.unwrap_or(interval).min(interval).max(self.config.ttl_floor())
    }

    fn update(&self, ips: Vec<IpAddr>, ttl: Duration, resolved_at: DateTime<Utc>, stale: bool) -> HostUpdate {
        HostUpdate {
            hostname: self.hostname.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            generation: self.generation,
            ips,
            ttl,
            resolved_at,
            stale,
        }
    }

    async fn send(&self, update: HostUpdate) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.updates.send(update) => result.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Lookup answering from a table that tests rewrite on the fly.
    #[derive(Default)]
    struct TableLookup {
        answers: Mutex<HashMap<String, Result<Vec<IpAddr>, String>>>,
    }

    impl TableLookup {
        fn set(&self, host: &str, answer: Result<Vec<&str>, &str>) {
            let answer = answer
                .map(|ips| ips.iter().map(|ip| ip.parse().unwrap()).collect())
                .map_err(str::to_string);
            self.answers.lock().unwrap().insert(host.to_string(), answer);
        }
    }

    #[async_trait]
    impl HostLookup for TableLookup {
        async fn lookup(&self, host: &str) -> Result<HostLookupAnswer, LookupError> {
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

    fn config() -> ResolverConfig {
        ResolverConfig {
            refresh_interval_ms: 40,
            ttl_floor_ms: 10,
            lookup_timeout_ms: 200,
            ..ResolverConfig::default()
        }
    }

    fn resolver(lookup: Arc<TableLookup>) -> (EndpointResolver, mpsc::Receiver<HostUpdate>) {
        let (tx, rx) = mpsc::channel(16);
        let metrics = DiscoveryMetrics::new().unwrap();
        let resolver = EndpointResolver::new(config(), lookup, tx, &CancellationToken::new(), metrics);
        (resolver, rx)
    }

    fn host(name: &str) -> InstanceAddress {
        InstanceAddress::Hostname(name.to_string())
    }

    async fn next_update(rx: &mut mpsc::Receiver<HostUpdate>) -> HostUpdate {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no host update in time")
            .expect("update channel closed")
    }

    #[tokio::test]
    async fn test_ip_literal_resolves_immediately() {
        let (mut resolver, _rx) = resolver(Arc::new(TableLookup::default()));
        let address = InstanceAddress::Ip("10.0.0.1".parse().unwrap());
        let resolution = resolver.resolve("my-svc-1", &address, 8080);
        assert_eq!(resolution.endpoints().len(), 1);
        assert_eq!(resolution.endpoints()[0].endpoint.to_string(), "10.0.0.1:8080");
        assert_eq!(resolver.tracked_hostnames(), 0);
    }

    #[tokio::test]
    async fn test_hostname_pending_until_first_answer() {
        let lookup = Arc::new(TableLookup::default());
        lookup.set("my-svc.service.dc1.consul", Ok(vec!["10.0.0.7"]));
        let (mut resolver, mut rx) = resolver(lookup);

        let address = host("my-svc.service.dc1.consul");
        assert!(resolver.resolve("my-svc-1", &address, 8080).is_pending());

        let update = next_update(&mut rx).await;
        assert_eq!(resolver.apply(update), vec!["my-svc-1".to_string()]);

        let resolution = resolver.resolve("my-svc-1", &address, 8080);
        assert_eq!(resolution.endpoints()[0].endpoint.to_string(), "10.0.0.7:8080");
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_keeps_last_good_as_stale() {
        let lookup = Arc::new(TableLookup::default());
        lookup.set("db.local", Ok(vec!["10.0.0.5"]));
        let (mut resolver, mut rx) = resolver(Arc::clone(&lookup));
        resolver.resolve("db-1", &host("db.local"), 5432);
        let first = next_update(&mut rx).await;
        resolver.apply(first);

        lookup.set("db.local", Err("SERVFAIL"));
        let stale = next_update(&mut rx).await;
        assert!(stale.stale);
        assert_eq!(stale.ips, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        resolver.apply(stale);

        let resolution = resolver.resolve("db-1", &host("db.local"), 5432);
        assert_eq!(resolution.endpoints().len(), 1);
        assert!(resolution.endpoints()[0].stale);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_evicts_only_when_unreferenced() {
        let lookup = Arc::new(TableLookup::default());
        lookup.set("shared.local", Ok(vec!["10.0.0.9"]));
        let (mut resolver, mut rx) = resolver(lookup);
        resolver.resolve("a", &host("shared.local"), 80);
        resolver.resolve("b", &host("shared.local"), 81);
        let update = next_update(&mut rx).await;
        let mut owners = resolver.apply(update);
        owners.sort();
        assert_eq!(owners, vec!["a".to_string(), "b".to_string()]);

        resolver.release("a");
        assert!(resolver.cached("shared.local").is_some());
        resolver.release("b");
        assert!(resolver.cached("shared.local").is_none());
        assert_eq!(resolver.tracked_hostnames(), 0);
    }

    #[tokio::test]
    async fn test_outdated_and_orphan_updates_ignored() {
        let lookup = Arc::new(TableLookup::default());
        lookup.set("svc.local", Ok(vec!["10.0.0.1"]));
        let (mut resolver, mut rx) = resolver(lookup);
        resolver.resolve("a", &host("svc.local"), 80);
        let update = next_update(&mut rx).await;

        let mut older = update.clone();
        older.sequence = 0;
        assert!(resolver.apply(older).is_empty());
        assert!(!resolver.apply(update.clone()).is_empty());
        assert!(resolver.apply(update.clone()).is_empty());

        resolver.release("a");
        let mut orphan = update;
        orphan.sequence += 100;
        assert!(resolver.apply(orphan).is_empty());
    }

    #[tokio::test]
    async fn test_update_from_replaced_task_ignored() {
        let lookup = Arc::new(TableLookup::default());
        lookup.set("svc.local", Ok(vec!["10.0.0.1"]));
        let (mut resolver, mut rx) = resolver(Arc::clone(&lookup));
        resolver.resolve("a", &host("svc.local"), 80);
        let mut late = next_update(&mut rx).await;

        // hostname dropped and picked up again before the first task's
        // answer is applied
        resolver.release("a");
        lookup.set("svc.local", Ok(vec!["10.0.0.2"]));
        resolver.resolve("a", &host("svc.local"), 80);

        // sequenced after the new task started, as a cancelled task racing
        // its send would be
        late.sequence += 100;
        assert!(resolver.apply(late).is_empty());
        assert!(resolver.cached("svc.local").is_none());

        let fresh = next_update(&mut rx).await;
        assert_eq!(fresh.ips, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.apply(fresh), vec!["a".to_string()]);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn test_address_change_moves_interest() {
        let lookup = Arc::new(TableLookup::default());
        lookup.set("old.local", Ok(vec!["10.0.0.1"]));
        let (mut resolver, _rx) = resolver(lookup);
        resolver.resolve("a", &host("old.local"), 80);
        assert_eq!(resolver.tracked_hostnames(), 1);

        let ip = InstanceAddress::Ip("10.0.0.2".parse().unwrap());
        resolver.resolve("a", &ip, 80);
        assert_eq!(resolver.tracked_hostnames(), 0);
    }

    #[test]
    fn test_cache_ttl_clamped() {
        let task = RefreshTask {
            hostname: "h".to_string(),
            generation: 1,
            config: config(),
            lookup: Arc::new(TableLookup::default()),
            permits: Arc::new(Semaphore::new(1)),
            sequence: Arc::new(AtomicU64::new(0)),
            updates: mpsc::channel(1).0,
            metrics: DiscoveryMetrics::new().unwrap(),
            cancel: CancellationToken::new(),
        };
        assert_eq!(task.cache_ttl(None), Duration::from_millis(40));
        assert_eq!(task.cache_ttl(Some(Duration::from_secs(300))), Duration::from_millis(40));
        assert_eq!(task.cache_ttl(Some(Duration::ZERO)), Duration::from_millis(10));
        assert_eq!(task.cache_ttl(Some(Duration::from_millis(20))), Duration::from_millis(20));
    }
}
