//! Snapshot publication: diffs, subscriptions and downstream push

use crate::backoff::Backoff;
use crate::endpoint::{Endpoint, ResolvedEndpoint};
use crate::error::PushError;
use crate::metrics::DiscoveryMetrics;
use crate::snapshot::{same_published, BucketKey, DiscoverySnapshot, SnapshotStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use router_api::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Endpoint changes of one bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketDiff {
    #[serde(flatten)]
    pub key: BucketKey,
    /// Endpoints new to the bucket, or whose owner or stale flag changed.
    pub added: Vec<ResolvedEndpoint>,
    pub removed: Vec<Endpoint>,
}

/// Changes between two snapshot versions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiff {
    pub from_version: u64,
    pub to_version: u64,
    pub published_at: DateTime<Utc>,
    pub buckets: Vec<BucketDiff>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// The whole snapshot expressed as additions to an empty one.
    pub fn full(snapshot: &DiscoverySnapshot) -> Self {
        diff(&DiscoverySnapshot::empty(), snapshot)
    }
}

/// Per-bucket endpoint additions and removals from `prev` to `next`,
/// ordered by bucket.
pub fn diff(prev: &DiscoverySnapshot, next: &DiscoverySnapshot) -> SnapshotDiff {
    let keys: BTreeSet<&BucketKey> = prev.buckets().keys().chain(next.buckets().keys()).collect();

    let mut buckets = Vec::new();
    for key in keys {
        let old = prev.bucket(key);
        let new = next.bucket(key);
        if let (Some(old), Some(new)) = (old, new) {
            if Arc::ptr_eq(old, new) {
                continue;
            }
        }

        let added: Vec<ResolvedEndpoint> = new
            .into_iter()
            .flat_map(|set| set.iter())
            .filter(|(endpoint, resolved)| {
                old.and_then(|o| o.get(*endpoint))
                    .map_or(true, |before| !same_published(before, resolved))
            })
            .map(|(_, resolved)| resolved.clone())
            .collect();
        let removed: Vec<Endpoint> = old
            .into_iter()
            .flat_map(|set| set.keys())
            .filter(|endpoint| new.map_or(true, |n| !n.contains_key(*endpoint)))
            .copied()
            .collect();

        if !added.is_empty() || !removed.is_empty() {
            buckets.push(BucketDiff {
                key: key.clone(),
                added,
                removed,
            });
        }
    }

    SnapshotDiff {
        from_version: prev.version(),
        to_version: next.version(),
        published_at: Utc::now(),
        buckets,
    }
}

/// What a subscriber receives.
#[derive(Clone, Debug)]
pub enum SnapshotUpdate {
    /// Complete state; sent first and after falling behind.
    Full(Arc<DiscoverySnapshot>),
    Diff(Arc<SnapshotDiff>),
}

impl SnapshotUpdate {
    pub fn version(&self) -> u64 {
        match self {
            SnapshotUpdate::Full(snapshot) => snapshot.version(),
            SnapshotUpdate::Diff(diff) => diff.to_version,
        }
    }
}

/// Single writer of the current snapshot.
pub struct SnapshotPublisher {
    store: Arc<SnapshotStore>,
    updates: broadcast::Sender<Arc<SnapshotDiff>>,
    changed: Notify,
    metrics: DiscoveryMetrics,
}

impl SnapshotPublisher {
    pub fn new(subscriber_capacity: usize, metrics: DiscoveryMetrics) -> Self {
        let (updates, _) = broadcast::channel(subscriber_capacity.max(1));
        Self {
            store: Arc::new(SnapshotStore::new()),
            updates,
            changed: Notify::new(),
            metrics,
        }
    }

    pub fn current(&self) -> Arc<DiscoverySnapshot> {
        self.store.current()
    }

    pub fn current_version(&self) -> u64 {
        self.store.current_version()
    }

    /// Make `next` current and notify subscribers. Nothing happens when it
    /// has no endpoint changes against the current snapshot.
    pub fn publish(&self, next: Arc<DiscoverySnapshot>) -> Option<Arc<SnapshotDiff>> {
        let prev = self.store.current();
        if Arc::ptr_eq(&prev, &next) || next.version() <= prev.version() {
            return None;
        }
        let diff = diff(&prev, &next);
        if diff.is_empty() {
            return None;
        }

        self.metrics.snapshot_version.set(next.version() as i64);
        self.metrics.snapshot_endpoints.set(next.endpoint_count() as i64);
        self.metrics.snapshots_published_total.inc();
        debug!(
            version = next.version(),
            buckets = diff.buckets.len(),
            "Publishing snapshot"
        );

        self.store.store(next);
        let diff = Arc::new(diff);
        // no receivers is fine
        let _ = self.updates.send(Arc::clone(&diff));
        self.changed.notify_one();
        Some(diff)
    }

    /// Full current state first, then every later diff in version order.
    pub fn subscribe(&self) -> Subscription {
        let updates = self.updates.subscribe();
        let snapshot = self.store.current();
        Subscription {
            version: snapshot.version(),
            initial: Some(snapshot),
            updates,
            store: Arc::clone(&self.store),
        }
    }

    /// Wait for the next publication.
    async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Stream of snapshot updates for one consumer.
pub struct Subscription {
    version: u64,
    initial: Option<Arc<DiscoverySnapshot>>,
    updates: broadcast::Receiver<Arc<SnapshotDiff>>,
    store: Arc<SnapshotStore>,
}

impl Subscription {
    /// Version the subscriber has seen so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Next update, or `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<SnapshotUpdate> {
        if let Some(snapshot) = self.initial.take() {
            return Some(SnapshotUpdate::Full(snapshot));
        }

        loop {
            match self.updates.recv().await {
                Ok(diff) if diff.to_version <= self.version => continue,
                Ok(diff) if diff.from_version == self.version => {
                    self.version = diff.to_version;
                    return Some(SnapshotUpdate::Diff(diff));
                }
                Ok(_) => return Some(self.resync()),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber fell behind, sending full snapshot");
                    return Some(self.resync());
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn resync(&mut self) -> SnapshotUpdate {
        let snapshot = self.store.current();
        self.version = snapshot.version();
        SnapshotUpdate::Full(snapshot)
    }
}

/// Downstream consumer of snapshot diffs, e.g. a proxy's config API.
#[async_trait]
pub trait SnapshotSink: Send + Sync + 'static {
    async fn push(&self, diff: &SnapshotDiff) -> Result<(), PushError>;
}

/// Deliver snapshots to `sink` until cancelled. Each push carries the diff
/// between the last delivered snapshot and the current one, so versions
/// published while a push is failing are coalesced.
pub async fn run_push_worker(
    publisher: Arc<SnapshotPublisher>,
    sink: Arc<dyn SnapshotSink>,
    backoff: BackoffConfig,
    cancel: CancellationToken,
    metrics: DiscoveryMetrics,
) {
    let mut delivered = Arc::new(DiscoverySnapshot::empty());
    let mut backoff = Backoff::new(backoff);
    info!("Snapshot push worker started");

    loop {
        let current = publisher.current();
        if current.version() != delivered.version() {
            let diff = diff(&delivered, &current);
            if diff.is_empty() {
                delivered = current;
                continue;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = sink.push(&diff) => result,
            };
            match result {
                Ok(()) => {
                    debug!(
                        from_version = diff.from_version,
                        to_version = diff.to_version,
                        "Pushed snapshot"
                    );
                    backoff.reset();
                    delivered = current;
                }
                Err(e) => {
                    metrics.push_failures_total.inc();
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        version = diff.to_version,
                        retry_in_ms = delay.as_millis() as u64,
                        "Snapshot push failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = publisher.changed() => {}
        }
    }

    info!("Snapshot push worker stopped");
}
