//! Registry-driven endpoint discovery
//!
//! This library provides:
//! - Registry watching with resync and backoff (`watcher`, `registry`)
//! - Tag visibility rules (`filter`)
//! - Hostname resolution on an independent refresh cadence (`resolver`)
//! - Versioned copy-on-write snapshots, their publication and selection
//!   (`snapshot`, `publisher`, `selector`)
//! - The reconciliation loop tying them together (`reconciler`)

pub mod backoff;
pub mod catalog;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod publisher;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod selector;
pub mod snapshot;
pub mod watcher;

pub use catalog::{InstanceCatalog, InstanceState};
pub use endpoint::{Endpoint, ResolvedEndpoint};
pub use error::{CoreError, LookupError, PushError, RegistryError, Result};
pub use filter::{is_visible, TagFilter};
pub use metrics::DiscoveryMetrics;
pub use publisher::{BucketDiff, SnapshotDiff, SnapshotPublisher, SnapshotSink, SnapshotUpdate, Subscription};
pub use reconciler::{Discovery, DiscoveryBuilder};
pub use registry::{CatalogPage, InMemoryRegistry, RegistryClient, ServicesPage};
pub use resolver::{EndpointResolver, HickoryLookup, HostLookup, HostLookupAnswer, HostUpdate, Resolution};
pub use snapshot::{BucketKey, DiscoverySnapshot, EndpointSet, SnapshotBuilder, SnapshotStore};
pub use watcher::{RegistryHealth, RegistryWatcher, ServiceSelection, WatchStream};
