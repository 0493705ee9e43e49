//! Versioned, immutable discovery snapshots

use crate::endpoint::{Endpoint, ResolvedEndpoint};
use arc_swap::ArcSwap;
use router_api::TagSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Snapshot bucket: one service name with one exact tag set.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketKey {
    pub service_name: String,
    pub tags: TagSet,
}

impl BucketKey {
    pub fn new(service_name: impl Into<String>, tags: TagSet) -> Self {
        Self {
            service_name: service_name.into(),
            tags,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.service_name, self.tags)
    }
}

/// Endpoints of one bucket, ordered and unique by `ip:port`.
pub type EndpointSet = BTreeMap<Endpoint, ResolvedEndpoint>;

/// Immutable view of every visible endpoint, grouped by bucket.
#[derive(Clone, Debug, Default)]
pub struct DiscoverySnapshot {
    version: u64,
    buckets: BTreeMap<BucketKey, Arc<EndpointSet>>,
}

impl DiscoverySnapshot {
    /// The empty snapshot every discovery starts from (version 0).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn buckets(&self) -> &BTreeMap<BucketKey, Arc<EndpointSet>> {
        &self.buckets
    }

    pub fn bucket(&self, key: &BucketKey) -> Option<&Arc<EndpointSet>> {
        self.buckets.get(key)
    }

    /// Buckets belonging to one service, in tag order.
    pub fn service_buckets<'a>(
        &'a self,
        service_name: &'a str,
    ) -> impl Iterator<Item = (&'a BucketKey, &'a Arc<EndpointSet>)> + 'a {
        let start = BucketKey::new(service_name, TagSet::new());
        self.buckets
            .range(start..)
            .take_while(move |(key, _)| key.service_name == service_name)
    }

    pub fn endpoint_count(&self) -> usize {
        self.buckets.values().map(|set| set.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Endpoints contributed by one visible instance.
#[derive(Clone, Debug)]
pub struct SnapshotInput<'a> {
    pub service_name: &'a str,
    pub tags: &'a TagSet,
    pub endpoints: &'a [ResolvedEndpoint],
}

/// Builds the next snapshot from the previous one and the current inputs.
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Build the snapshot for `inputs`. Buckets whose endpoints, owners and
    /// stale flags did not change keep the previous `Arc`; when nothing changed the previous
    /// snapshot itself is returned and the version stays the same.
    pub fn build<'a, I>(prev: &Arc<DiscoverySnapshot>, inputs: I) -> Arc<DiscoverySnapshot>
    where
        I: IntoIterator<Item = SnapshotInput<'a>>,
    {
        let mut next: BTreeMap<BucketKey, EndpointSet> = BTreeMap::new();

        for input in inputs {
            if input.endpoints.is_empty() {
                continue;
            }
            let set = next
                .entry(BucketKey::new(input.service_name, input.tags.clone()))
                .or_default();
            for resolved in input.endpoints {
                match set.get(&resolved.endpoint) {
                    // smallest instance id owns a shared endpoint
                    Some(existing) if existing.instance_id <= resolved.instance_id => {}
                    _ => {
                        set.insert(resolved.endpoint, resolved.clone());
                    }
                }
            }
        }

        let mut changed = next.len() != prev.buckets.len();
        let mut buckets = BTreeMap::new();
        for (key, set) in next {
            match prev.buckets.get(&key) {
                Some(old) if same_endpoints(old, &set) => {
                    buckets.insert(key, Arc::clone(old));
                }
                _ => {
                    changed = true;
                    buckets.insert(key, Arc::new(set));
                }
            }
        }

        if !changed {
            return Arc::clone(prev);
        }

        Arc::new(DiscoverySnapshot {
            version: prev.version + 1,
            buckets,
        })
    }
}

fn same_endpoints(a: &EndpointSet, b: &EndpointSet) -> bool {
    a.len() == b.len() && a.values().zip(b.values()).all(|(x, y)| same_published(x, y))
}

/// Equal as far as consumers are concerned: address, owning instance and
/// staleness. Refresh timestamps alone do not make a new version.
pub(crate) fn same_published(a: &ResolvedEndpoint, b: &ResolvedEndpoint) -> bool {
    a.endpoint == b.endpoint && a.instance_id == b.instance_id && a.stale == b.stale
}

/// Holder of the current snapshot. One writer swaps whole snapshots in;
/// readers load without locking.
pub struct SnapshotStore {
    current: ArcSwap<DiscoverySnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(DiscoverySnapshot::empty()),
        }
    }

    pub fn current(&self) -> Arc<DiscoverySnapshot> {
        self.current.load_full()
    }

    pub fn current_version(&self) -> u64 {
        self.current.load().version
    }

    pub(crate) fn store(&self, snapshot: Arc<DiscoverySnapshot>) {
        self.current.store(snapshot);
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn resolved(ip: &str, port: u16, instance: &str) -> ResolvedEndpoint {
        ResolvedEndpoint {
            endpoint: Endpoint::new(ip.parse().unwrap(), port),
            instance_id: instance.to_string(),
            resolved_at: Utc::now(),
            ttl: Duration::from_secs(5),
            stale: false,
        }
    }

    fn tags(list: &[&str]) -> TagSet {
        list.iter().copied().collect()
    }

    #[test]
    fn test_build_groups_by_bucket() {
        let t1 = tags(&["svc", "1"]);
        let t2 = tags(&["svc", "2"]);
        let e1 = vec![resolved("10.0.0.1", 80, "a")];
        let e2 = vec![resolved("10.0.0.2", 80, "b")];
        let prev = Arc::new(DiscoverySnapshot::empty());

        let next = SnapshotBuilder::build(
            &prev,
            vec![
                SnapshotInput { service_name: "my-svc", tags: &t1, endpoints: &e1 },
                SnapshotInput { service_name: "my-svc", tags: &t2, endpoints: &e2 },
            ],
        );

        assert_eq!(next.version(), 1);
        assert_eq!(next.buckets().len(), 2);
        assert_eq!(next.endpoint_count(), 2);
        assert_eq!(next.service_buckets("my-svc").count(), 2);
        assert_eq!(next.service_buckets("my-sv").count(), 0);
    }

    #[test]
    fn test_identical_inputs_keep_version() {
        let t1 = tags(&["svc"]);
        let e1 = vec![resolved("10.0.0.1", 80, "a")];
        let prev = Arc::new(DiscoverySnapshot::empty());
        let input = || SnapshotInput { service_name: "my-svc", tags: &t1, endpoints: &e1 };

        let first = SnapshotBuilder::build(&prev, vec![input()]);
        let second = SnapshotBuilder::build(&first, vec![input()]);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.version(), 1);
    }

    #[test]
    fn test_refresh_timestamp_keeps_version() {
        let t1 = tags(&["svc"]);
        let fresh = vec![resolved("10.0.0.1", 80, "a")];
        let mut refreshed = fresh.clone();
        refreshed[0].resolved_at = fresh[0].resolved_at + chrono::Duration::seconds(30);
        refreshed[0].ttl = Duration::from_secs(1);
        let prev = Arc::new(DiscoverySnapshot::empty());

        let first = SnapshotBuilder::build(
            &prev,
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &fresh }],
        );
        let second = SnapshotBuilder::build(
            &first,
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &refreshed }],
        );
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_stale_flag_is_published() {
        let t1 = tags(&["svc"]);
        let key = BucketKey::new("s", t1.clone());
        let fresh = vec![resolved("10.0.0.1", 80, "a")];
        let mut stale = fresh.clone();
        stale[0].stale = true;
        let prev = Arc::new(DiscoverySnapshot::empty());

        let first = SnapshotBuilder::build(
            &prev,
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &fresh }],
        );
        let second = SnapshotBuilder::build(
            &first,
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &stale }],
        );
        assert_eq!(second.version(), first.version() + 1);
        assert!(second.bucket(&key).unwrap().values().all(|r| r.stale));

        let third = SnapshotBuilder::build(
            &second,
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &fresh }],
        );
        assert_eq!(third.version(), second.version() + 1);
        assert!(third.bucket(&key).unwrap().values().all(|r| !r.stale));
    }

    #[test]
    fn test_shared_endpoint_changes_owner_on_removal() {
        let t1 = tags(&["svc"]);
        let key = BucketKey::new("s", t1.clone());
        let from_a = vec![resolved("10.0.0.1", 80, "a")];
        let from_b = vec![resolved("10.0.0.1", 80, "b")];
        let prev = Arc::new(DiscoverySnapshot::empty());

        let first = SnapshotBuilder::build(
            &prev,
            vec![
                SnapshotInput { service_name: "s", tags: &t1, endpoints: &from_a },
                SnapshotInput { service_name: "s", tags: &t1, endpoints: &from_b },
            ],
        );
        assert_eq!(first.bucket(&key).unwrap().values().next().unwrap().instance_id, "a");

        // `a` deregistered; `b` still serves the same address
        let second = SnapshotBuilder::build(
            &first,
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &from_b }],
        );
        assert_eq!(second.version(), first.version() + 1);
        assert!(!Arc::ptr_eq(first.bucket(&key).unwrap(), second.bucket(&key).unwrap()));
        assert_eq!(second.bucket(&key).unwrap().values().next().unwrap().instance_id, "b");
    }

    #[test]
    fn test_unchanged_buckets_are_shared() {
        let t1 = tags(&["1"]);
        let t2 = tags(&["2"]);
        let e1 = vec![resolved("10.0.0.1", 80, "a")];
        let e2 = vec![resolved("10.0.0.2", 80, "b")];
        let e2b = vec![resolved("10.0.0.3", 80, "b")];
        let prev = Arc::new(DiscoverySnapshot::empty());

        let first = SnapshotBuilder::build(
            &prev,
            vec![
                SnapshotInput { service_name: "s", tags: &t1, endpoints: &e1 },
                SnapshotInput { service_name: "s", tags: &t2, endpoints: &e2 },
            ],
        );
        let second = SnapshotBuilder::build(
            &first,
            vec![
                SnapshotInput { service_name: "s", tags: &t1, endpoints: &e1 },
                SnapshotInput { service_name: "s", tags: &t2, endpoints: &e2b },
            ],
        );

        assert_eq!(second.version(), 2);
        let key1 = BucketKey::new("s", t1.clone());
        let key2 = BucketKey::new("s", t2.clone());
        assert!(Arc::ptr_eq(first.bucket(&key1).unwrap(), second.bucket(&key1).unwrap()));
        assert!(!Arc::ptr_eq(first.bucket(&key2).unwrap(), second.bucket(&key2).unwrap()));
    }

    #[test]
    fn test_dedup_smallest_instance_owns() {
        let t1 = tags(&["svc"]);
        let from_b = vec![resolved("10.0.0.1", 80, "b")];
        let from_a = vec![resolved("10.0.0.1", 80, "a")];
        let prev = Arc::new(DiscoverySnapshot::empty());

        let next = SnapshotBuilder::build(
            &prev,
            vec![
                SnapshotInput { service_name: "s", tags: &t1, endpoints: &from_b },
                SnapshotInput { service_name: "s", tags: &t1, endpoints: &from_a },
            ],
        );
        let bucket = next.bucket(&BucketKey::new("s", t1.clone())).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.values().next().unwrap().instance_id, "a");
    }

    #[test]
    fn test_empty_buckets_dropped() {
        let t1 = tags(&["svc"]);
        let e1 = vec![resolved("10.0.0.1", 80, "a")];
        let none: Vec<ResolvedEndpoint> = Vec::new();
        let prev = Arc::new(DiscoverySnapshot::empty());

        let first = SnapshotBuilder::build(
            &prev,
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &e1 }],
        );
        let second = SnapshotBuilder::build(
            &first,
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &none }],
        );
        assert!(second.is_empty());
        assert_eq!(second.version(), 2);
    }

    #[test]
    fn test_store_swaps() {
        let store = SnapshotStore::new();
        assert_eq!(store.current_version(), 0);
        let t1 = tags(&["svc"]);
        let e1 = vec![resolved("10.0.0.1", 80, "a")];
        let next = SnapshotBuilder::build(
            &store.current(),
            vec![SnapshotInput { service_name: "s", tags: &t1, endpoints: &e1 }],
        );
        store.store(next);
        assert_eq!(store.current_version(), 1);
    }
}
