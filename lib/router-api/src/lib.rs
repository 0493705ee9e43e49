//! Data model for registry-driven endpoint discovery
//!
//! This library defines the types shared by the discovery crates:
//! - ServiceInstanceRecord / WatchEvent: registry membership and its changes
//! - TagSet: sorted tag sets used for visibility and selection
//! - RouteSelector: the consumer-side endpoint query
//! - DiscoveryConfig: daemon configuration loaded from YAML

pub mod config;
pub mod error;
pub mod instance;
pub mod tags;

pub use config::{
    AdminConfig, BackoffConfig, DiscoveryConfig, PublisherConfig, RegistryConfig,
    ResolverConfig, TagFilterConfig, TagFilterMode, TelemetryConfig,
};
pub use error::{ApiError, ConfigError};
pub use instance::{InstanceAddress, RouteSelector, ServiceInstanceRecord, WatchEvent};
pub use tags::TagSet;
