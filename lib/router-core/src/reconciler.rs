//! Reconciliation loop and the `Discovery` handle
//!
//! One task owns the catalog, the tag filter and the resolver cache. It
//! folds watch events, hostname updates and control commands into the
//! catalog and publishes a new snapshot once per batch of input.

use crate::catalog::{InstanceCatalog, InstanceState};
use crate::endpoint::Endpoint;
use crate::error::{CoreError, Result};
use crate::filter::TagFilter;
use crate::metrics::DiscoveryMetrics;
use crate::publisher::{run_push_worker, SnapshotPublisher, SnapshotSink, Subscription};
use crate::registry::RegistryClient;
use crate::resolver::{EndpointResolver, HickoryLookup, HostLookup, HostUpdate, Resolution};
use crate::selector;
use crate::snapshot::{DiscoverySnapshot, SnapshotBuilder};
use crate::watcher::{RegistryHealth, RegistryWatcher, ServiceSelection, WatchStream};
use router_api::{DiscoveryConfig, RouteSelector, TagFilterConfig, TagSet, WatchEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Messages folded into one snapshot rebuild, at most.
const MAX_BATCH: usize = 512;
const HOST_UPDATE_BUFFER: usize = 1024;
const COMMAND_BUFFER: usize = 64;

enum Command {
    SetAllowlist(TagFilterConfig),
    InstanceState {
        instance_id: String,
        reply: oneshot::Sender<InstanceState>,
    },
}

struct Reconciler {
    catalog: InstanceCatalog,
    filter: TagFilter,
    resolver: EndpointResolver,
    watcher: RegistryWatcher,
    publisher: Arc<SnapshotPublisher>,
}

impl Reconciler {
    async fn run(
        mut self,
        mut events: WatchStream,
        mut host_updates: mpsc::Receiver<HostUpdate>,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        let mut watching = true;
        let mut controlled = true;
        info!("Reconciler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv(), if controlled => match command {
                    Some(command) => self.on_command(command),
                    None => controlled = false,
                },
                event = events.recv(), if watching => match event {
                    Some(event) => self.on_watch_event(event),
                    None => {
                        debug!("Watch stream ended");
                        watching = false;
                    }
                },
                Some(update) = host_updates.recv() => self.on_host_update(update),
            }

            for _ in 0..MAX_BATCH {
                if let Ok(event) = events.try_recv() {
                    self.on_watch_event(event);
                } else if let Ok(update) = host_updates.try_recv() {
                    self.on_host_update(update);
                } else {
                    break;
                }
            }

            self.rebuild();
        }

        self.watcher.stop();
        drop(events);
        self.watcher.join().await;
        self.resolver.shutdown().await;
        info!("Reconciler stopped");
    }

    fn on_watch_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Added(record) | WatchEvent::Updated(record) => {
                debug!(
                    service = %record.service_name,
                    instance = %record.instance_id,
                    tags = %record.tags,
                    address = %record.address,
                    port = record.port,
                    "Instance registered"
                );
                let id = record.instance_id.clone();
                self.catalog.upsert(record);
                self.evaluate(&id);
            }
            WatchEvent::Removed(record) => {
                if self.catalog.remove(&record).is_some() {
                    debug!(
                        service = %record.service_name,
                        instance = %record.instance_id,
                        "Instance removed"
                    );
                    self.resolver.release(&record.instance_id);
                }
            }
        }
    }

    fn on_host_update(&mut self, update: HostUpdate) {
        for id in self.resolver.apply(update) {
            let Some(entry) = self.catalog.get_mut(&id) else {
                continue;
            };
            if entry.visible == Some(true) {
                entry.resolution =
                    self.resolver
                        .resolve(&id, &entry.record.address, entry.record.port);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SetAllowlist(config) => {
                info!(allowlist = %config.allowlist, mode = ?config.mode, "Updating tag allowlist");
                self.filter = TagFilter::new(config);
                for id in self.catalog.ids() {
                    self.evaluate(&id);
                }
            }
            Command::InstanceState { instance_id, reply } => {
                let _ = reply.send(self.catalog.state(&instance_id));
            }
        }
    }

    /// Run the tag filter on one entry and start or drop its resolution.
    fn evaluate(&mut self, instance_id: &str) {
        let Some(entry) = self.catalog.get_mut(instance_id) else {
            return;
        };
        let visible = self.filter.is_visible(&entry.record.tags);
        let was_visible = entry.visible == Some(true);
        entry.visible = Some(visible);

        if visible {
            entry.resolution =
                self.resolver
                    .resolve(instance_id, &entry.record.address, entry.record.port);
        } else {
            if was_visible {
                debug!(instance = %instance_id, "Instance hidden by tag filter");
            }
            self.resolver.release(instance_id);
            entry.resolution = Resolution::Pending;
        }
    }

    fn rebuild(&mut self) {
        let current = self.publisher.current();
        let next = SnapshotBuilder::build(&current, self.catalog.snapshot_inputs());
        if let Some(diff) = self.publisher.publish(next) {
            info!(
                version = diff.to_version,
                changed_buckets = diff.buckets.len(),
                instances = self.catalog.len(),
                "Published discovery snapshot"
            );
        }
    }
}

/// Assembles a [`Discovery`] from its collaborators.
pub struct DiscoveryBuilder {
    config: DiscoveryConfig,
    registry: Option<Arc<dyn RegistryClient>>,
    lookup: Option<Arc<dyn HostLookup>>,
    sink: Option<Arc<dyn SnapshotSink>>,
    metrics: Option<DiscoveryMetrics>,
    cancel: Option<CancellationToken>,
}

impl DiscoveryBuilder {
    pub fn registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Hostname lookups; hickory against `resolver.dns_address` by default.
    pub fn lookup(mut self, lookup: Arc<dyn HostLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Downstream sink receiving every snapshot change.
    pub fn sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Parent token; cancelling it stops discovery like [`Discovery::shutdown`].
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Spawn the watcher, resolver, reconciler and push worker.
    pub fn start(self) -> Result<Discovery> {
        self.config
            .validate()
            .map_err(|e| CoreError::InvalidConfiguration(e.to_string()))?;
        let registry = self
            .registry
            .ok_or_else(|| CoreError::InvalidConfiguration("a registry client is required".into()))?;
        let lookup: Arc<dyn HostLookup> = match self.lookup {
            Some(lookup) => lookup,
            None => Arc::new(HickoryLookup::from_config(&self.config.resolver)?),
        };
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => DiscoveryMetrics::new()?,
        };
        let cancel = self.cancel.map(|c| c.child_token()).unwrap_or_default();

        let publisher = Arc::new(SnapshotPublisher::new(
            self.config.publisher.subscriber_capacity,
            metrics.clone(),
        ));

        let mut watcher = RegistryWatcher::new(
            registry,
            ServiceSelection::from_services(&self.config.registry.services),
            self.config.registry.clone(),
            metrics.clone(),
        );
        let health = watcher.health();
        let events = watcher.start(&cancel);

        let (host_tx, host_rx) = mpsc::channel(HOST_UPDATE_BUFFER);
        let resolver = EndpointResolver::new(
            self.config.resolver.clone(),
            lookup,
            host_tx,
            &cancel,
            metrics.clone(),
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let reconciler = Reconciler {
            catalog: InstanceCatalog::new(),
            filter: TagFilter::new(self.config.filter.clone()),
            resolver,
            watcher,
            publisher: Arc::clone(&publisher),
        };

        let mut tasks = vec![tokio::spawn(reconciler.run(
            events,
            host_rx,
            command_rx,
            cancel.clone(),
        ))];

        if let Some(sink) = self.sink {
            tasks.push(tokio::spawn(run_push_worker(
                Arc::clone(&publisher),
                sink,
                self.config.publisher.backoff.clone(),
                cancel.clone(),
                metrics.clone(),
            )));
        }

        info!(
            allowlist = %self.config.filter.allowlist,
            mode = ?self.config.filter.mode,
            "Discovery started"
        );

        Ok(Discovery {
            publisher,
            commands: command_tx,
            health,
            metrics,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Running discovery: query surface over the current snapshot plus
/// control of the background tasks.
pub struct Discovery {
    publisher: Arc<SnapshotPublisher>,
    commands: mpsc::Sender<Command>,
    health: RegistryHealth,
    metrics: DiscoveryMetrics,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    pub fn builder(config: DiscoveryConfig) -> DiscoveryBuilder {
        DiscoveryBuilder {
            config,
            registry: None,
            lookup: None,
            sink: None,
            metrics: None,
            cancel: None,
        }
    }

    /// Endpoints of `service_name` whose bucket tags cover `required_tags`.
    pub fn resolve(&self, service_name: &str, required_tags: &TagSet) -> Vec<Endpoint> {
        selector::select(&self.publisher.current(), service_name, required_tags)
    }

    pub fn resolve_route(&self, route: &RouteSelector) -> Vec<Endpoint> {
        selector::select_route(&self.publisher.current(), route)
    }

    pub fn current_version(&self) -> u64 {
        self.publisher.current_version()
    }

    pub fn snapshot(&self) -> Arc<DiscoverySnapshot> {
        self.publisher.current()
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    /// Replace the tag filter. Instances move between visible and hidden
    /// without any registry event.
    pub async fn set_allowlist(&self, config: TagFilterConfig) -> Result<()> {
        self.commands
            .send(Command::SetAllowlist(config))
            .await
            .map_err(|_| CoreError::Shutdown)
    }

    pub async fn instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::InstanceState {
                instance_id: instance_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| CoreError::Shutdown)?;
        rx.await.map_err(|_| CoreError::Shutdown)
    }

    /// True while the registry cannot be reached; the last known snapshot
    /// keeps being served.
    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.metrics
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Discovery stopped");
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
