use crate::{ApiError, TagSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Address of a registered instance as published by the registry.
///
/// Registries accept either an IP literal or a DNS name; only the latter needs
/// the resolver.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceAddress {
    Ip(IpAddr),
    Hostname(String),
}

impl InstanceAddress {
    /// Parse a raw registry address. Bracketed IPv6 (`[::1]`) is accepted,
    /// a trailing dot on hostnames is dropped.
    pub fn parse(raw: &str) -> Result<Self, ApiError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ApiError::InvalidAddress(raw.to_string()));
        }

        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);
        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(InstanceAddress::Ip(ip));
        }

        let host = trimmed.trim_end_matches('.');
        if host.is_empty() || host.contains(char::is_whitespace) || host.contains('/') {
            return Err(ApiError::InvalidAddress(raw.to_string()));
        }
        Ok(InstanceAddress::Hostname(host.to_ascii_lowercase()))
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, InstanceAddress::Hostname(_))
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceAddress::Ip(ip) => write!(f, "{}", ip),
            InstanceAddress::Hostname(host) => write!(f, "{}", host),
        }
    }
}

/// One registered instance of a service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceRecord {
    pub service_name: String,
    pub instance_id: String,
    #[serde(default)]
    pub tags: TagSet,
    pub address: InstanceAddress,
    pub port: u16,
    /// Registry-assigned modify index; higher means newer.
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

impl ServiceInstanceRecord {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: InstanceAddress,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            tags: TagSet::new(),
            address,
            port,
            revision: 0,
            datacenter: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Same instance with the same observable content, ignoring the revision.
    pub fn same_content(&self, other: &ServiceInstanceRecord) -> bool {
        self.service_name == other.service_name
            && self.instance_id == other.instance_id
            && self.tags == other.tags
            && self.address == other.address
            && self.port == other.port
            && self.datacenter == other.datacenter
    }
}

/// Ordered membership change emitted by the registry watcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "camelCase")]
pub enum WatchEvent {
    Added(ServiceInstanceRecord),
    Updated(ServiceInstanceRecord),
    Removed(ServiceInstanceRecord),
}

impl WatchEvent {
    pub fn record(&self) -> &ServiceInstanceRecord {
        match self {
            WatchEvent::Added(r) | WatchEvent::Updated(r) | WatchEvent::Removed(r) => r,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated(_) => "updated",
            WatchEvent::Removed(_) => "removed",
        }
    }
}

/// Consumer-side query: endpoints of `service_name` whose tags cover
/// `required_tags`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSelector {
    pub service_name: String,
    #[serde(default)]
    pub required_tags: TagSet,
}

impl RouteSelector {
    pub fn new(service_name: impl Into<String>, required_tags: TagSet) -> Self {
        Self {
            service_name: service_name.into(),
            required_tags,
        }
    }
}
