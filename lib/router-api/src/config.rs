//! Daemon configuration, loaded from YAML.

use crate::{ConfigError, TagSet};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the discovery daemon.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub filter: TagFilterConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl DiscoveryConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: DiscoveryConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.backoff.validate("registry.backoff")?;
        self.resolver.backoff.validate("resolver.backoff")?;
        self.publisher.backoff.validate("publisher.backoff")?;

        if self.registry.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("registry.request_timeout_ms must be > 0".into()));
        }
        // Consul adds up to wait/16 of jitter to a blocking query
        let wait_ms = self.registry.wait_seconds.saturating_mul(1_000);
        let longest_wait_ms = wait_ms.saturating_add(wait_ms / 16);
        if self.registry.request_timeout_ms <= longest_wait_ms {
            return Err(ConfigError::Invalid(format!(
                "registry.request_timeout_ms must exceed the blocking wait of {}ms",
                longest_wait_ms
            )));
        }
        if self.resolver.refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid("resolver.refresh_interval_ms must be > 0".into()));
        }
        if self.resolver.ttl_floor_ms == 0 {
            return Err(ConfigError::Invalid("resolver.ttl_floor_ms must be > 0".into()));
        }
        if self.resolver.ttl_floor_ms > self.resolver.refresh_interval_ms {
            return Err(ConfigError::Invalid(
                "resolver.ttl_floor_ms must not exceed resolver.refresh_interval_ms".into(),
            ));
        }
        if self.resolver.lookup_timeout_ms == 0 {
            return Err(ConfigError::Invalid("resolver.lookup_timeout_ms must be > 0".into()));
        }
        if self.resolver.max_concurrent_lookups == 0 {
            return Err(ConfigError::Invalid("resolver.max_concurrent_lookups must be > 0".into()));
        }
        if self.publisher.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid("publisher.subscriber_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Exponential backoff parameters shared by the registry watcher, the
/// resolver and the push worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Fraction of each delay that is randomized, in `[0, 1]`.
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.initial_ms == 0 || self.max_ms < self.initial_ms {
            return Err(ConfigError::Invalid(format!(
                "{}: require 0 < initial_ms <= max_ms",
                section
            )));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!("{}: multiplier must be >= 1", section)));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!("{}: jitter must be within [0, 1]", section)));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

/// Connection to the service registry (Consul).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_address")]
    pub address: String,

    /// Datacenters to query; empty means the agent's own datacenter.
    #[serde(default)]
    pub datacenters: Vec<String>,

    /// Services to watch; empty means every service in the catalog.
    #[serde(default)]
    pub services: Vec<String>,

    /// Optional ACL token sent as `X-Consul-Token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Blocking query wait time.
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Capacity of the watch event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl RegistryConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: default_registry_address(),
            datacenters: Vec::new(),
            services: Vec::new(),
            token: None,
            wait_seconds: default_wait_seconds(),
            request_timeout_ms: default_request_timeout_ms(),
            event_buffer: default_event_buffer(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// How the allowlist is matched against instance tags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagFilterMode {
    /// Instance tags must contain every allowlisted tag.
    #[default]
    All,
    /// Instance tags must contain at least one allowlisted tag.
    Any,
}

/// Tag visibility rules.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilterConfig {
    #[serde(default)]
    pub allowlist: TagSet,

    #[serde(default)]
    pub mode: TagFilterMode,
}

impl TagFilterConfig {
    pub fn new(allowlist: TagSet) -> Self {
        Self {
            allowlist,
            mode: TagFilterMode::All,
        }
    }

    pub fn with_mode(mut self, mode: TagFilterMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Hostname resolution settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// DNS server used for hostname addresses; the system resolver when unset.
    #[serde(default = "default_dns_address")]
    pub dns_address: Option<SocketAddr>,

    /// Upper bound between two lookups of the same hostname.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Lower bound between two lookups of the same hostname.
    #[serde(default = "default_ttl_floor_ms")]
    pub ttl_floor_ms: u64,

    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,

    #[serde(default = "default_resolver_backoff")]
    pub backoff: BackoffConfig,
}

impl ResolverConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn ttl_floor(&self) -> Duration {
        Duration::from_millis(self.ttl_floor_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dns_address: default_dns_address(),
            refresh_interval_ms: default_refresh_interval_ms(),
            ttl_floor_ms: default_ttl_floor_ms(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
            backoff: default_resolver_backoff(),
        }
    }
}

/// Snapshot publication and downstream push.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Endpoint receiving snapshot diffs as JSON; push is disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_url: Option<String>,

    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,

    /// Buffered diffs per subscriber before it is resynced with a full snapshot.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl PublisherConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            push_url: None,
            push_timeout_ms: default_push_timeout_ms(),
            subscriber_capacity: default_subscriber_capacity(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Admin HTTP listener (query API and metrics).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_admin_addr(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON formatted logs.
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

// Default values
fn default_backoff_initial_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_registry_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_wait_seconds() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    35_000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_dns_address() -> Option<SocketAddr> {
    Some(SocketAddr::from(([127, 0, 0, 1], 8600)))
}

fn default_refresh_interval_ms() -> u64 {
    5_000
}

fn default_ttl_floor_ms() -> u64 {
    1_000
}

fn default_lookup_timeout_ms() -> u64 {
    2_000
}

fn default_max_concurrent_lookups() -> usize {
    32
}

fn default_resolver_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_ms: 500,
        max_ms: 5_000,
        ..BackoffConfig::default()
    }
}

fn default_push_timeout_ms() -> u64 {
    5_000
}

fn default_subscriber_capacity() -> usize {
    64
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DiscoveryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.registry.address, "http://127.0.0.1:8500");
        assert_eq!(config.resolver.dns_address, Some("127.0.0.1:8600".parse().unwrap()));
        assert_eq!(config.filter.mode, TagFilterMode::All);
        assert!(config.publisher.push_url.is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let raw = r#"
registry:
  address: http://consul:8500
  services: [my-svc]
  datacenters: [dc1]
filter:
  allowlist: ["2", "1"]
  mode: any
resolver:
  dns_address: 10.0.0.2:53
  refresh_interval_ms: 2000
  ttl_floor_ms: 500
publisher:
  push_url: http://proxy:9901/discovery
"#;
        let config = DiscoveryConfig::from_yaml_str(raw).unwrap();
        assert_eq!(config.registry.services, vec!["my-svc".to_string()]);
        assert_eq!(config.filter.allowlist, ["1", "2"].into_iter().collect());
        assert_eq!(config.filter.mode, TagFilterMode::Any);
        assert_eq!(config.resolver.refresh_interval(), Duration::from_secs(2));
        assert_eq!(config.resolver.ttl_floor(), Duration::from_millis(500));
        assert_eq!(config.publisher.push_url.as_deref(), Some("http://proxy:9901/discovery"));
        // untouched sections keep their defaults
        assert_eq!(config.registry.wait_seconds, 30);
    }

    #[test]
    fn test_rejects_floor_above_interval() {
        let raw = r#"
resolver:
  refresh_interval_ms: 1000
  ttl_floor_ms: 2000
"#;
        let err = DiscoveryConfig::from_yaml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_timeout_within_blocking_wait() {
        let raw = r#"
registry:
  wait_seconds: 30
  request_timeout_ms: 5000
"#;
        let err = DiscoveryConfig::from_yaml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        // 30s plus 1875ms of jitter
        let mut config = DiscoveryConfig::default();
        config.registry.request_timeout_ms = 31_875;
        assert!(config.validate().is_err());
        config.registry.request_timeout_ms = 31_876;
        config.validate().unwrap();

        config.registry.wait_seconds = 0;
        config.registry.request_timeout_ms = 1_000;
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let raw = r#"
registry:
  backoff:
    initial_ms: 100
    max_ms: 10
"#;
        assert!(DiscoveryConfig::from_yaml_str(raw).is_err());
    }

    #[test]
    fn test_null_dns_address_means_system_resolver() {
        let config = DiscoveryConfig::from_yaml_str("resolver:\n  dns_address: null\n").unwrap();
        assert!(config.resolver.dns_address.is_none());
    }
}
