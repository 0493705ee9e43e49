//! HTTP client for the Consul catalog API

use crate::catalog::{service_names, CatalogServiceEntry};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use router_api::{RegistryConfig, ServiceInstanceRecord};
use router_core::{CatalogPage, DiscoveryMetrics, RegistryClient, RegistryError, ServicesPage};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// ConsulClient queries the catalog with blocking queries.
///
/// With several datacenters configured the first one drives blocking and its
/// index is the page index; the others are read without blocking on every
/// round, so their changes surface within one wait period.
pub struct ConsulClient {
    http: Client,
    base_url: Url,
    datacenters: Vec<Option<String>>,
    token: Option<String>,
    wait: Duration,
    request_timeout: Duration,
    metrics: DiscoveryMetrics,
}

impl ConsulClient {
    /// Create a new Consul client
    pub fn new(config: &RegistryConfig, metrics: DiscoveryMetrics) -> Result<Self, RegistryError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RegistryError::Unavailable(format!("building HTTP client: {}", e)))?;

        let base_url = Url::parse(config.address.trim_end_matches('/')).map_err(|e| {
            RegistryError::Unavailable(format!("invalid registry address {}: {}", config.address, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(RegistryError::Unavailable(format!(
                "invalid registry address {}",
                config.address
            )));
        }

        let datacenters = if config.datacenters.is_empty() {
            vec![None]
        } else {
            config.datacenters.iter().cloned().map(Some).collect()
        };

        Ok(Self {
            http,
            base_url,
            datacenters,
            token: config.token.clone(),
            wait: config.wait(),
            request_timeout: config.request_timeout(),
            metrics,
        })
    }

    fn qualify_datacenter(&self) -> bool {
        self.datacenters.len() > 1
    }

    /// URL of an API path, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Issue one catalog GET. Returns the `X-Consul-Index` with the body.
    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        datacenter: Option<&str>,
        after_index: Option<u64>,
    ) -> Result<(u64, T), RegistryError> {
        let url = self.url(segments);
        let path = url.path().to_string();
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(dc) = datacenter {
            query.push(("dc", dc.to_string()));
        }
        if let Some(index) = after_index {
            query.push(("index", index.to_string()));
            query.push(("wait", format!("{}s", self.wait.as_secs())));
        }

        let mut request = self.http.get(url).query(&query);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RegistryError::Timeout(self.request_timeout)
            } else {
                RegistryError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("{} returned {}: {}", path, status, body.trim());
            return Err(match status {
                StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT => RegistryError::Unavailable(detail),
                _ => RegistryError::InvalidResponse(detail),
            });
        }

        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| {
                RegistryError::InvalidResponse(format!("{} missing {} header", path, INDEX_HEADER))
            })?;

        let body = response
            .json::<T>()
            .await
            .map_err(|e| RegistryError::InvalidResponse(format!("{}: {}", path, e)))?;

        Ok((index, body))
    }

    fn records(&self, service: &str, entries: Vec<CatalogServiceEntry>) -> Vec<ServiceInstanceRecord> {
        let qualify = self.qualify_datacenter();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.into_record(service, qualify) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.metrics.malformed_records_total.inc();
                    warn!(service = %service, error = %e, "Dropping malformed catalog entry");
                }
            }
        }
        records
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn list(
        &self,
        service: &str,
        after_index: Option<u64>,
    ) -> Result<CatalogPage, RegistryError> {
        let path = ["v1", "catalog", "service", service];
        let mut page = CatalogPage::default();

        for (i, dc) in self.datacenters.iter().enumerate() {
            let blocking = if i == 0 { after_index } else { None };
            let (index, entries) = self
                .get::<Vec<CatalogServiceEntry>>(&path, dc.as_deref(), blocking)
                .await?;
            if i == 0 {
                page.index = index;
            }
            debug!(
                service = %service,
                datacenter = dc.as_deref().unwrap_or("local"),
                index = index,
                entries = entries.len(),
                "Catalog page received"
            );
            page.instances.extend(self.records(service, entries));
        }

        Ok(page)
    }

    async fn services(&self, after_index: Option<u64>) -> Result<ServicesPage, RegistryError> {
        let mut page = ServicesPage::default();
        let mut merged = HashMap::new();

        for (i, dc) in self.datacenters.iter().enumerate() {
            let blocking = if i == 0 { after_index } else { None };
            let (index, body) = self
                .get::<HashMap<String, Option<Vec<String>>>>(&["v1", "catalog", "services"], dc.as_deref(), blocking)
                .await?;
            if i == 0 {
                page.index = index;
            }
            merged.extend(body);
        }

        page.services = service_names(merged);
        Ok(page)
    }
}
