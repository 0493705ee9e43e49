//! Service registry client interface and an in-memory registry

use crate::error::RegistryError;
use async_trait::async_trait;
use router_api::ServiceInstanceRecord;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

/// Instances of one service at a registry index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogPage {
    pub index: u64,
    pub instances: Vec<ServiceInstanceRecord>,
}

/// Service names known to the registry at an index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServicesPage {
    pub index: u64,
    pub services: Vec<String>,
}

/// Read access to a service registry.
///
/// Both calls are blocking queries: with `after_index` set, the call returns
/// once the registry index moves past it or the implementation's wait time
/// elapses, in which case the same index is returned again.
#[async_trait]
pub trait RegistryClient: Send + Sync + 'static {
    async fn list(
        &self,
        service: &str,
        after_index: Option<u64>,
    ) -> Result<CatalogPage, RegistryError>;

    async fn services(&self, after_index: Option<u64>) -> Result<ServicesPage, RegistryError>;
}

#[derive(Default)]
struct RegistryState {
    index: u64,
    // instance id -> record
    instances: HashMap<String, ServiceInstanceRecord>,
    unavailable: bool,
}

/// Registry held in process memory. Used by tests and by embedders that
/// feed membership from another source. Clones share the same state.
#[derive(Clone)]
pub struct InMemoryRegistry {
    state: Arc<RwLock<RegistryState>>,
    changed: Arc<Notify>,
    wait: Duration,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::with_wait(Duration::from_secs(5))
    }

    /// Registry whose blocking queries give up after `wait`.
    pub fn with_wait(wait: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            changed: Arc::new(Notify::new()),
            wait,
        }
    }

    /// Register or replace an instance. The record's revision is set to the
    /// new registry index, which is returned.
    pub async fn register(&self, mut record: ServiceInstanceRecord) -> u64 {
        let index = {
            let mut state = self.state.write().await;
            state.index += 1;
            record.revision = state.index;
            debug!(
                service = %record.service_name,
                instance = %record.instance_id,
                index = state.index,
                "Registered instance"
            );
            state.instances.insert(record.instance_id.clone(), record);
            state.index
        };
        self.changed.notify_waiters();
        index
    }

    /// Remove an instance. Returns false if it was not registered.
    pub async fn deregister(&self, instance_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.instances.remove(instance_id).is_some();
            if removed {
                state.index += 1;
                debug!(instance = %instance_id, index = state.index, "Deregistered instance");
            }
            removed
        };
        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    /// Simulate an outage: every query fails until availability is restored.
    pub async fn set_available(&self, available: bool) {
        self.state.write().await.unavailable = !available;
        self.changed.notify_waiters();
    }

    /// Simulate a registry restart that lost its raft index.
    pub async fn reset_index(&self) {
        {
            let mut state = self.state.write().await;
            state.index = 1;
            for record in state.instances.values_mut() {
                record.revision = 1;
            }
        }
        self.changed.notify_waiters();
    }

    pub async fn index(&self) -> u64 {
        self.state.read().await.index
    }

    /// Wait until the index passes `after_index`, the wait time elapses or
    /// availability changes. Returns an error while unavailable.
    async fn wait_for_change(&self, after_index: Option<u64>) -> Result<(), RegistryError> {
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            let notified = self.changed.notified();
            {
                let state = self.state.read().await;
                if state.unavailable {
                    return Err(RegistryError::Unavailable("registry is down".to_string()));
                }
                match after_index {
                    Some(after) if state.index == after => {}
                    _ => return Ok(()),
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(());
            }
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn list(
        &self,
        service: &str,
        after_index: Option<u64>,
    ) -> Result<CatalogPage, RegistryError> {
        self.wait_for_change(after_index).await?;

        let state = self.state.read().await;
        let mut instances: Vec<ServiceInstanceRecord> = state
            .instances
            .values()
            .filter(|r| r.service_name == service)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        Ok(CatalogPage {
            index: state.index,
            instances,
        })
    }

    async fn services(&self, after_index: Option<u64>) -> Result<ServicesPage, RegistryError> {
        self.wait_for_change(after_index).await?;

        let state = self.state.read().await;
        let services: BTreeSet<&str> = state
            .instances
            .values()
            .map(|r| r.service_name.as_str())
            .collect();

        Ok(ServicesPage {
            index: state.index,
            services: services.into_iter().map(str::to_string).collect(),
        })
    }
}
