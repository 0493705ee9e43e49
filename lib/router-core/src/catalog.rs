//! Instance catalog owned by the reconciler

use crate::resolver::Resolution;
use crate::snapshot::SnapshotInput;
use router_api::ServiceInstanceRecord;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Lifecycle of one registered instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    Unknown,
    /// Known to the registry, not yet checked against the tag filter.
    Registered,
    /// Filtered out; holds no endpoints.
    Hidden,
    /// Visible, hostname not resolved yet.
    Resolving,
    Resolved,
    Removed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Unknown => "unknown",
            InstanceState::Registered => "registered",
            InstanceState::Hidden => "hidden",
            InstanceState::Resolving => "resolving",
            InstanceState::Resolved => "resolved",
            InstanceState::Removed => "removed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub record: ServiceInstanceRecord,
    /// `None` until the tag filter has looked at the record.
    pub visible: Option<bool>,
    pub resolution: Resolution,
}

impl CatalogEntry {
    pub fn state(&self) -> InstanceState {
        match self.visible {
            None => InstanceState::Registered,
            Some(false) => InstanceState::Hidden,
            Some(true) if self.resolution.is_pending() => InstanceState::Resolving,
            Some(true) => InstanceState::Resolved,
        }
    }
}

/// Registered instances keyed by instance id.
#[derive(Debug, Default)]
pub struct InstanceCatalog {
    entries: BTreeMap<String, CatalogEntry>,
    removed: HashSet<String>,
}

impl InstanceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record. The entry goes back to `Registered`
    /// until the filter runs again.
    pub fn upsert(&mut self, record: ServiceInstanceRecord) -> &mut CatalogEntry {
        self.removed.remove(&record.instance_id);
        let id = record.instance_id.clone();
        let entry = self.entries.entry(id).or_insert_with(|| CatalogEntry {
            record: record.clone(),
            visible: None,
            resolution: Resolution::Pending,
        });
        entry.record = record;
        entry.visible = None;
        entry
    }

    /// Remove an instance. A removal for another service than the one the
    /// id is currently registered under is ignored, since watch streams of
    /// different services are not ordered against each other.
    pub fn remove(&mut self, record: &ServiceInstanceRecord) -> Option<CatalogEntry> {
        match self.entries.get(&record.instance_id) {
            Some(entry) if entry.record.service_name == record.service_name => {}
            _ => return None,
        }
        self.removed.insert(record.instance_id.clone());
        self.entries.remove(&record.instance_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<&CatalogEntry> {
        self.entries.get(instance_id)
    }

    pub fn get_mut(&mut self, instance_id: &str) -> Option<&mut CatalogEntry> {
        self.entries.get_mut(instance_id)
    }

    pub fn state(&self, instance_id: &str) -> InstanceState {
        match self.entries.get(instance_id) {
            Some(entry) => entry.state(),
            None if self.removed.contains(instance_id) => InstanceState::Removed,
            None => InstanceState::Unknown,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builder inputs for every visible instance.
    pub fn snapshot_inputs(&self) -> impl Iterator<Item = SnapshotInput<'_>> {
        self.entries
            .values()
            .filter(|entry| entry.visible == Some(true))
            .map(|entry| SnapshotInput {
                service_name: &entry.record.service_name,
                tags: &entry.record.tags,
                endpoints: entry.resolution.endpoints(),
            })
    }
}
