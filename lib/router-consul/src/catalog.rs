//! Consul catalog payloads
//!
//! `/v1/catalog/service/:name` returns one entry per registration. Entries
//! are decoded leniently and validated when converted into
//! [`ServiceInstanceRecord`]s, so one bad registration does not poison the
//! whole page.

use router_api::{ApiError, InstanceAddress, ServiceInstanceRecord};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};

/// One entry of a catalog service listing.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogServiceEntry {
    #[serde(default)]
    pub node: String,

    /// Node address, used when the service registered without one.
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(rename = "ServiceID", default)]
    pub service_id: String,

    #[serde(default)]
    pub service_name: String,

    #[serde(default)]
    pub service_tags: Option<Vec<String>>,

    #[serde(default)]
    pub service_address: String,

    #[serde(default)]
    pub service_port: u32,

    #[serde(default)]
    pub modify_index: u64,
}

impl CatalogServiceEntry {
    /// Instance id unique across the catalog. Consul only guarantees
    /// `ServiceID` uniqueness per agent, so the node is always part of it and
    /// the datacenter is added when several are merged.
    pub fn instance_id(&self, qualify_datacenter: bool) -> String {
        match (&self.datacenter, qualify_datacenter) {
            (Some(dc), true) => format!("{}/{}/{}", dc, self.node, self.service_id),
            _ => format!("{}/{}", self.node, self.service_id),
        }
    }

    /// Validate the entry and convert it into a registry record.
    pub fn into_record(
        self,
        service: &str,
        qualify_datacenter: bool,
    ) -> Result<ServiceInstanceRecord, ApiError> {
        if self.service_id.is_empty() {
            return Err(ApiError::InvalidRecord(format!(
                "{} entry on node {:?} has no ServiceID",
                service, self.node
            )));
        }

        let raw_address = if self.service_address.trim().is_empty() {
            &self.address
        } else {
            &self.service_address
        };
        let address = InstanceAddress::parse(raw_address)?;

        let port = match u16::try_from(self.service_port) {
            Ok(port) if port != 0 => port,
            _ => {
                return Err(ApiError::InvalidRecord(format!(
                    "{} has invalid port {}",
                    self.service_id, self.service_port
                )))
            }
        };

        let service_name = if self.service_name.is_empty() {
            service.to_string()
        } else {
            self.service_name.clone()
        };

        let mut record =
            ServiceInstanceRecord::new(service_name, self.instance_id(qualify_datacenter), address, port)
                .with_tags(self.service_tags.unwrap_or_default())
                .with_revision(self.modify_index);
        if let Some(dc) = self.datacenter {
            record = record.with_datacenter(dc);
        }
        Ok(record)
    }
}

/// Service names from a `/v1/catalog/services` body (name → tags).
pub fn service_names(body: HashMap<String, Option<Vec<String>>>) -> Vec<String> {
    body.into_keys()
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
