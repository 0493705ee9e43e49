//! Route selection over a snapshot

use crate::endpoint::Endpoint;
use crate::snapshot::DiscoverySnapshot;
use router_api::{RouteSelector, TagSet};
use std::collections::BTreeSet;

/// Endpoints of `service_name` in every bucket whose tags cover
/// `required_tags`. Sorted and unique; empty when nothing matches.
pub fn select(snapshot: &DiscoverySnapshot, service_name: &str, required_tags: &TagSet) -> Vec<Endpoint> {
    let endpoints: BTreeSet<Endpoint> = snapshot
        .service_buckets(service_name)
        .filter(|(key, _)| key.tags.is_superset(required_tags))
        .flat_map(|(_, set)| set.keys().copied())
        .collect();
    endpoints.into_iter().collect()
}

/// [`select`] driven by a [`RouteSelector`].
pub fn select_route(snapshot: &DiscoverySnapshot, selector: &RouteSelector) -> Vec<Endpoint> {
    select(snapshot, &selector.service_name, &selector.required_tags)
}
