//! Consul catalog integration
pub mod catalog;
pub mod client;

pub use catalog::CatalogServiceEntry;
pub use client::ConsulClient;
