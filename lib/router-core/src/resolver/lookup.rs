//! Hostname lookups

use crate::error::LookupError;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig as DnsConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use router_api::ResolverConfig;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Answer for one hostname. An empty `ips` is a valid, authoritative answer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostLookupAnswer {
    pub ips: Vec<IpAddr>,
    /// Record TTL when the lookup reported one.
    pub ttl: Option<Duration>,
}

impl HostLookupAnswer {
    pub fn new(ips: Vec<IpAddr>, ttl: Option<Duration>) -> Self {
        Self { ips, ttl }
    }
}

/// Resolves a hostname to IP addresses.
#[async_trait]
pub trait HostLookup: Send + Sync + 'static {
    async fn lookup(&self, host: &str) -> Result<HostLookupAnswer, LookupError>;
}

/// A/AAAA lookups through hickory, against a fixed DNS server (Consul's DNS
/// interface by default) or the system configuration.
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryLookup {
    pub fn from_config(config: &ResolverConfig) -> Result<Self, LookupError> {
        let resolver = match config.dns_address {
            Some(addr) => {
                info!("Resolving hostnames via {}", addr);
                let servers = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
                let dns_config = DnsConfig::from_parts(None, vec![], servers);
                TokioAsyncResolver::tokio(dns_config, lookup_opts(config))
            }
            None => {
                info!("Resolving hostnames via system configuration");
                let (dns_config, mut opts) = hickory_resolver::system_conf::read_system_conf()
                    .map_err(|e| LookupError::Failed {
                        host: "<system>".to_string(),
                        reason: e.to_string(),
                    })?;
                opts.timeout = config.lookup_timeout();
                TokioAsyncResolver::tokio(dns_config, opts)
            }
        };
        Ok(Self {
            resolver,
            timeout: config.lookup_timeout(),
        })
    }
}

fn lookup_opts(config: &ResolverConfig) -> ResolverOpts {
    let mut opts = ResolverOpts::default();
    opts.timeout = config.lookup_timeout();
    opts.attempts = 1;
    opts
}

#[async_trait]
impl HostLookup for HickoryLookup {
    async fn lookup(&self, host: &str) -> Result<HostLookupAnswer, LookupError> {
        match self.resolver.lookup_ip(host).await {
            Ok(answer) => {
                let ttl = answer.valid_until().saturating_duration_since(Instant::now());
                Ok(HostLookupAnswer::new(answer.iter().collect(), Some(ttl)))
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { negative_ttl, .. } => Ok(HostLookupAnswer::new(
                    Vec::new(),
                    negative_ttl.map(|secs| Duration::from_secs(u64::from(secs))),
                )),
                ResolveErrorKind::Timeout => Err(LookupError::Timeout {
                    host: host.to_string(),
                    timeout: self.timeout,
                }),
                _ => Err(LookupError::Failed {
                    host: host.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_opts_follow_config() {
        let config = ResolverConfig {
            lookup_timeout_ms: 750,
            ..ResolverConfig::default()
        };
        let opts = lookup_opts(&config);
        assert_eq!(opts.timeout, Duration::from_millis(750));
        assert_eq!(opts.attempts, 1);
    }

    #[tokio::test]
    async fn test_builds_against_fixed_server() {
        let config = ResolverConfig {
            dns_address: Some("127.0.0.1:8600".parse().unwrap()),
            ..ResolverConfig::default()
        };
        assert!(HickoryLookup::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_ip_literal_host_needs_no_server() {
        let lookup = HickoryLookup::from_config(&ResolverConfig::default()).unwrap();
        let answer = lookup.lookup("10.1.2.3").await.unwrap();
        assert_eq!(answer.ips, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
    }
}
