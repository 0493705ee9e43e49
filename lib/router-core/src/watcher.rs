//! Registry watcher
//!
//! Turns blocking registry queries into an ordered stream of
//! [`WatchEvent`]s, one task per watched service.

use crate::backoff::Backoff;
use crate::error::RegistryError;
use crate::metrics::DiscoveryMetrics;
use crate::registry::RegistryClient;
use router_api::{RegistryConfig, ServiceInstanceRecord, WatchEvent};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ordered membership changes, bounded so a slow consumer pushes back on
/// the watch tasks.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

/// Which services to watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceSelection {
    Named(Vec<String>),
    /// Every service in the catalog, following services as they come and go.
    All,
}

impl ServiceSelection {
    /// An empty list means every service.
    pub fn from_services(services: &[String]) -> Self {
        if services.is_empty() {
            ServiceSelection::All
        } else {
            ServiceSelection::Named(services.to_vec())
        }
    }
}

/// Shared view of registry reachability. Degraded while any watch task is
/// failing.
#[derive(Clone)]
pub struct RegistryHealth {
    failing: Arc<AtomicUsize>,
    metrics: DiscoveryMetrics,
}

impl RegistryHealth {
    fn new(metrics: DiscoveryMetrics) -> Self {
        Self {
            failing: Arc::new(AtomicUsize::new(0)),
            metrics,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.failing.load(Ordering::SeqCst) > 0
    }

    fn failed(&self) {
        self.failing.fetch_add(1, Ordering::SeqCst);
        self.metrics.registry_degraded.set(1);
    }

    fn recovered(&self) {
        if self.failing.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.metrics.registry_degraded.set(0);
        }
    }
}

/// Watches a set of services in a registry.
pub struct RegistryWatcher {
    client: Arc<dyn RegistryClient>,
    selection: ServiceSelection,
    config: RegistryConfig,
    metrics: DiscoveryMetrics,
    health: RegistryHealth,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl RegistryWatcher {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        selection: ServiceSelection,
        config: RegistryConfig,
        metrics: DiscoveryMetrics,
    ) -> Self {
        let health = RegistryHealth::new(metrics.clone());
        Self {
            client,
            selection,
            config,
            metrics,
            health,
            cancel: None,
            tasks: Vec::new(),
        }
    }

    /// Spawn the watch tasks. They stop when `cancel` fires or on [`stop`].
    ///
    /// [`stop`]: RegistryWatcher::stop
    pub fn start(&mut self, cancel: &CancellationToken) -> WatchStream {
        self.stop();
        let token = cancel.child_token();
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));

        match &self.selection {
            ServiceSelection::Named(services) => {
                info!("Watching services: {}", services.join(", "));
                for service in services {
                    let watch = self.service_watch(service, tx.clone(), token.child_token());
                    self.tasks.push(tokio::spawn(async move {
                        watch.run().await;
                    }));
                }
            }
            ServiceSelection::All => {
                info!("Watching all catalog services");
                let catalog = CatalogWatch {
                    client: Arc::clone(&self.client),
                    tx,
                    config: self.config.clone(),
                    metrics: self.metrics.clone(),
                    health: self.health.clone(),
                    cancel: token.clone(),
                };
                self.tasks.push(tokio::spawn(catalog.run()));
            }
        }

        self.cancel = Some(token);
        rx
    }

    /// Cancel all watch tasks. The stream ends once they have exited.
    pub fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    /// Wait for the watch tasks to exit after [`stop`](RegistryWatcher::stop).
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn health(&self) -> RegistryHealth {
        self.health.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    fn service_watch(
        &self,
        service: &str,
        tx: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> ServiceWatch {
        ServiceWatch {
            service: service.to_string(),
            client: Arc::clone(&self.client),
            tx,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            health: self.health.clone(),
            cancel,
        }
    }
}

impl Drop for RegistryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Retry state shared by the service and catalog loops.
struct Retry {
    backoff: Backoff,
    failing: bool,
    health: RegistryHealth,
}

impl Retry {
    fn new(config: &RegistryConfig, health: RegistryHealth) -> Self {
        Self {
            backoff: Backoff::new(config.backoff.clone()),
            failing: false,
            health,
        }
    }

    fn succeeded(&mut self, what: &str) {
        self.backoff.reset();
        if self.failing {
            self.failing = false;
            self.health.recovered();
            info!("Registry watch for {} recovered", what);
        }
    }

    /// Mark the failure and wait out the backoff. False when cancelled.
    async fn failed(&mut self, what: &str, error: &RegistryError, cancel: &CancellationToken) -> bool {
        if !self.failing {
            self.failing = true;
            self.health.failed();
        }
        let delay = self.backoff.next_delay();
        warn!(
            watch = %what,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Registry request failed"
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Drop for Retry {
    fn drop(&mut self) {
        if self.failing {
            self.health.recovered();
        }
    }
}

/// Run one registry request under the configured timeout. `None` when
/// cancelled first.
async fn bounded<T, F>(
    config: &RegistryConfig,
    cancel: &CancellationToken,
    request: F,
) -> Option<Result<T, RegistryError>>
where
    F: Future<Output = Result<T, RegistryError>>,
{
    let timeout = config.request_timeout();
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = tokio::time::timeout(timeout, request) => {
            Some(result.unwrap_or(Err(RegistryError::Timeout(timeout))))
        }
    }
}

/// Whether the next page must be treated as a full resync.
fn needs_resync(service: &str, last_index: Option<u64>, index: u64) -> bool {
    match last_index {
        None => true,
        Some(last) if index < last => {
            warn!(
                watch = %service,
                last_index = last,
                index,
                "Registry index moved backwards, resyncing"
            );
            true
        }
        Some(_) => false,
    }
}

/// Events for a full resync: every present instance is `Added`, known
/// instances that are gone are `Removed`.
pub(crate) fn resync_events(
    known: &HashMap<String, ServiceInstanceRecord>,
    instances: Vec<ServiceInstanceRecord>,
) -> Vec<WatchEvent> {
    let current: BTreeMap<String, ServiceInstanceRecord> = instances
        .into_iter()
        .map(|r| (r.instance_id.clone(), r))
        .collect();

    let mut gone: Vec<&ServiceInstanceRecord> = known
        .values()
        .filter(|r| !current.contains_key(&r.instance_id))
        .collect();
    gone.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    let removed: Vec<WatchEvent> = gone.into_iter().cloned().map(WatchEvent::Removed).collect();
    current
        .into_values()
        .map(WatchEvent::Added)
        .chain(removed)
        .collect()
}

/// Events between the known set and a new page.
pub(crate) fn diff_events(
    known: &HashMap<String, ServiceInstanceRecord>,
    instances: Vec<ServiceInstanceRecord>,
) -> Vec<WatchEvent> {
    let current: BTreeMap<String, ServiceInstanceRecord> = instances
        .into_iter()
        .map(|r| (r.instance_id.clone(), r))
        .collect();

    let mut gone: Vec<&ServiceInstanceRecord> = known
        .values()
        .filter(|r| !current.contains_key(&r.instance_id))
        .collect();
    gone.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    let removed: Vec<WatchEvent> = gone.into_iter().cloned().map(WatchEvent::Removed).collect();

    let mut events = Vec::new();
    for (id, record) in current {
        match known.get(&id) {
            None => events.push(WatchEvent::Added(record)),
            Some(prev) if prev.revision != record.revision || !prev.same_content(&record) => {
                events.push(WatchEvent::Updated(record))
            }
            Some(_) => {}
        }
    }
    events.extend(removed);
    events
}

/// Apply a delivered event to the known set.
pub(crate) fn apply_event(known: &mut HashMap<String, ServiceInstanceRecord>, event: &WatchEvent) {
    match event {
        WatchEvent::Added(r) | WatchEvent::Updated(r) => {
            known.insert(r.instance_id.clone(), r.clone());
        }
        WatchEvent::Removed(r) => {
            known.remove(&r.instance_id);
        }
    }
}

/// Watch loop for one service.
struct ServiceWatch {
    service: String,
    client: Arc<dyn RegistryClient>,
    tx: mpsc::Sender<WatchEvent>,
    config: RegistryConfig,
    metrics: DiscoveryMetrics,
    health: RegistryHealth,
    cancel: CancellationToken,
}

impl ServiceWatch {
    /// Runs until cancelled or the stream is dropped. Returns the instances
    /// known at exit.
    async fn run(self) -> Vec<ServiceInstanceRecord> {
        let mut known: HashMap<String, ServiceInstanceRecord> = HashMap::new();
        let mut index: Option<u64> = None;
        let mut retry = Retry::new(&self.config, self.health.clone());
        debug!(service = %self.service, "Service watch started");

        loop {
            let request = self.client.list(&self.service, index);
            let Some(result) = bounded(&self.config, &self.cancel, request).await else {
                break;
            };

            match result {
                Ok(page) => {
                    retry.succeeded(&self.service);
                    let events = if needs_resync(&self.service, index, page.index) {
                        debug!(
                            service = %self.service,
                            instances = page.instances.len(),
                            "Resyncing service"
                        );
                        resync_events(&known, page.instances)
                    } else {
                        diff_events(&known, page.instances)
                    };
                    index = Some(page.index.max(1));

                    if !self.emit(events, &mut known).await {
                        break;
                    }
                }
                Err(e) => {
                    self.metrics.registry_errors_total.inc();
                    // the next success is a full resync
                    index = None;
                    if !retry.failed(&self.service, &e, &self.cancel).await {
                        break;
                    }
                }
            }
        }

        debug!(service = %self.service, "Service watch stopped");
        known.into_values().collect()
    }

    /// Send events in order, folding each delivered one into `known`.
    async fn emit(
        &self,
        events: Vec<WatchEvent>,
        known: &mut HashMap<String, ServiceInstanceRecord>,
    ) -> bool {
        for event in events {
            let kind = event.kind();
            let delivered = event.clone();
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => false,
                result = self.tx.send(event) => result.is_ok(),
            };
            if !sent {
                return false;
            }
            self.metrics.watch_events_total.with_label_values(&[kind]).inc();
            apply_event(known, &delivered);
        }
        true
    }
}

/// Follows the catalog's service list, starting and retiring service watches.
struct CatalogWatch {
    client: Arc<dyn RegistryClient>,
    tx: mpsc::Sender<WatchEvent>,
    config: RegistryConfig,
    metrics: DiscoveryMetrics,
    health: RegistryHealth,
    cancel: CancellationToken,
}

struct RunningWatch {
    cancel: CancellationToken,
    handle: JoinHandle<Vec<ServiceInstanceRecord>>,
}

impl CatalogWatch {
    async fn run(self) {
        let mut running: BTreeMap<String, RunningWatch> = BTreeMap::new();
        let mut index: Option<u64> = None;
        let mut retry = Retry::new(&self.config, self.health.clone());

        loop {
            let request = self.client.services(index);
            let Some(result) = bounded(&self.config, &self.cancel, request).await else {
                break;
            };

            match result {
                Ok(page) => {
                    retry.succeeded("catalog");
                    needs_resync("catalog", index, page.index);
                    index = Some(page.index.max(1));

                    let wanted: BTreeSet<String> = page.services.into_iter().collect();
                    for service in &wanted {
                        if !running.contains_key(service) {
                            info!(service = %service, "Service appeared in catalog");
                            running.insert(service.clone(), self.spawn_service(service));
                        }
                    }

                    let retired: Vec<String> = running
                        .keys()
                        .filter(|s| !wanted.contains(*s))
                        .cloned()
                        .collect();
                    for service in retired {
                        if let Some(watch) = running.remove(&service) {
                            info!(service = %service, "Service left the catalog");
                            if !self.retire(watch).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.metrics.registry_errors_total.inc();
                    index = None;
                    if !retry.failed("catalog", &e, &self.cancel).await {
                        break;
                    }
                }
            }
        }

        for (_, watch) in running {
            watch.cancel.cancel();
            let _ = watch.handle.await;
        }
    }

    fn spawn_service(&self, service: &str) -> RunningWatch {
        let cancel = self.cancel.child_token();
        let watch = ServiceWatch {
            service: service.to_string(),
            client: Arc::clone(&self.client),
            tx: self.tx.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            health: self.health.clone(),
            cancel: cancel.clone(),
        };
        RunningWatch {
            cancel,
            handle: tokio::spawn(watch.run()),
        }
    }

    /// Stop a service watch and remove whatever it still knew about.
    async fn retire(&self, watch: RunningWatch) -> bool {
        watch.cancel.cancel();
        let mut leftover = watch.handle.await.unwrap_or_default();
        leftover.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        for record in leftover {
            self.metrics
                .watch_events_total
                .with_label_values(&["removed"])
                .inc();
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => false,
                result = self.tx.send(WatchEvent::Removed(record)) => result.is_ok(),
            };
            if !sent {
                return false;
            }
        }
        true
    }
}
