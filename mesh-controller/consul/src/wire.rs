//! Consul's JSON representations of services, limited to the fields the mesh uses.

use ovs_mesh_controller_core::{CatalogEntry, ServiceDescriptor, UpstreamBinding};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    num::NonZeroU16,
};

/// The body of `PUT /v1/agent/service/register`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Registration<'a> {
    #[serde(rename = "ID")]
    pub id: &'a str,
    pub name: &'a str,
    pub tags: &'a BTreeSet<String>,
    pub address: IpAddr,
    pub port: u16,
    pub meta: &'a BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<Connect>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Connect {
    pub sidecar_service: SidecarService,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SidecarService {
    pub proxy: Proxy,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Proxy {
    #[serde(default)]
    pub upstreams: Option<Vec<Upstream>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Upstream {
    pub destination_name: String,

    #[serde(default)]
    pub local_bind_address: String,

    #[serde(default)]
    pub local_bind_port: u16,
}

/// An element of the `GET /v1/health/service/<name>` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct HealthEntry {
    #[serde(default)]
    pub node: Node,
    pub service: AgentService,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Node {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub meta: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub proxy: Option<Proxy>,
}

// === impl Registration ===

impl<'a> From<&'a ServiceDescriptor> for Registration<'a> {
    fn from(svc: &'a ServiceDescriptor) -> Self {
        // Services without upstreams are registered without a sidecar.
        let connect = (!svc.upstreams.is_empty()).then(|| Connect {
            sidecar_service: SidecarService {
                proxy: Proxy {
                    upstreams: Some(svc.upstreams.iter().map(Upstream::from).collect()),
                },
            },
        });

        Self {
            id: &svc.id,
            name: &svc.name,
            tags: &svc.tags,
            address: svc.address,
            port: svc.port,
            meta: &svc.meta,
            connect,
        }
    }
}

// === impl Upstream ===

impl From<&UpstreamBinding> for Upstream {
    fn from(binding: &UpstreamBinding) -> Self {
        Self {
            destination_name: binding.destination_service.clone(),
            local_bind_address: binding.local_bind_address.to_string(),
            local_bind_port: binding.local_bind_port.get(),
        }
    }
}

impl Upstream {
    fn to_binding(&self) -> Option<UpstreamBinding> {
        Some(UpstreamBinding {
            destination_service: self.destination_name.clone(),
            local_bind_address: self.local_bind_address.parse().ok()?,
            local_bind_port: NonZeroU16::new(self.local_bind_port)?,
        })
    }
}

// === impl HealthEntry ===

impl HealthEntry {
    /// The address clients should use: the service's own address, or the node's when the
    /// service was registered without one.
    pub fn address(&self) -> &str {
        if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        }
    }

    /// Returns `None` if the instance's address isn't an IP address.
    pub fn into_catalog_entry(self) -> Option<CatalogEntry> {
        let address = self.address().parse().ok()?;
        // Upstreams that don't describe a local binding aren't ours and are ignored.
        let upstreams = self
            .service
            .proxy
            .iter()
            .flat_map(|p| p.upstreams.iter().flatten())
            .filter_map(Upstream::to_binding)
            .collect();

        Some(CatalogEntry {
            service_id: self.service.id,
            service_name: self.service.service,
            address,
            port: self.service.port,
            upstreams,
            meta: self.service.meta.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, btreeset};
    use serde_json::json;

    fn descriptor(upstreams: Vec<UpstreamBinding>) -> ServiceDescriptor {
        ServiceDescriptor {
            id: "web-0-app".to_string(),
            name: "web".to_string(),
            address: "10.0.0.5".parse().unwrap(),
            port: 8080,
            tags: btreeset! { "managed-by:ovs-servicemesh".to_string() },
            meta: btreemap! {
                "k8s-namespace".to_string() => "default".to_string(),
                "k8s-pod".to_string() => "web-0".to_string(),
            },
            upstreams,
        }
    }

    #[test]
    fn registration_without_upstreams() {
        let svc = descriptor(vec![]);
        let body = serde_json::to_value(Registration::from(&svc)).unwrap();
        assert_eq!(
            body,
            json!({
                "ID": "web-0-app",
                "Name": "web",
                "Tags": ["managed-by:ovs-servicemesh"],
                "Address": "10.0.0.5",
                "Port": 8080,
                "Meta": {
                    "k8s-namespace": "default",
                    "k8s-pod": "web-0",
                },
            })
        );
    }

    #[test]
    fn registration_with_upstreams() {
        let svc = descriptor(vec![UpstreamBinding {
            destination_service: "cache".to_string(),
            local_bind_address: "10.1.1.254".parse().unwrap(),
            local_bind_port: NonZeroU16::new(6379).unwrap(),
        }]);
        let body = serde_json::to_value(Registration::from(&svc)).unwrap();
        assert_eq!(
            body["Connect"],
            json!({
                "SidecarService": {
                    "Proxy": {
                        "Upstreams": [{
                            "DestinationName": "cache",
                            "LocalBindAddress": "10.1.1.254",
                            "LocalBindPort": 6379,
                        }],
                    },
                },
            })
        );
    }

    #[test]
    fn health_entry_to_catalog_entry() {
        let entry: HealthEntry = serde_json::from_value(json!({
            "Node": { "Node": "node-a", "Address": "192.168.1.10" },
            "Service": {
                "ID": "cache-0-redis",
                "Service": "cache",
                "Tags": ["managed-by:ovs-servicemesh"],
                "Address": "10.0.0.9",
                "Port": 6379,
                "Meta": { "k8s-namespace": "default", "k8s-pod": "cache-0" },
                "Proxy": {
                    "Upstreams": [
                        { "DestinationName": "db", "LocalBindAddress": "10.1.1.254", "LocalBindPort": 5432 },
                        { "DestinationType": "prepared_query", "DestinationName": "q" },
                    ],
                },
            },
            "Checks": [],
        }))
        .unwrap();

        let entry = entry.into_catalog_entry().expect("entry must convert");
        assert_eq!(entry.service_id, "cache-0-redis");
        assert_eq!(entry.service_name, "cache");
        assert_eq!(entry.address, "10.0.0.9".parse::<IpAddr>().unwrap());
        assert_eq!(entry.port, 6379);
        assert_eq!(entry.pod(), Some(("default", "cache-0")));
        assert_eq!(entry.upstreams.len(), 1);
        assert_eq!(entry.upstreams[0].destination_service, "db");
    }

    #[test]
    fn falls_back_to_node_address() {
        let entry: HealthEntry = serde_json::from_value(json!({
            "Node": { "Address": "192.168.1.10" },
            "Service": {
                "ID": "legacy",
                "Service": "legacy",
                "Address": "",
                "Port": 80,
                "Meta": null,
                "Proxy": { "Upstreams": null },
            },
        }))
        .unwrap();

        let entry = entry.into_catalog_entry().expect("entry must convert");
        assert_eq!(entry.address, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert!(entry.meta.is_empty());
        assert!(entry.upstreams.is_empty());
    }

    #[test]
    fn hostname_address_is_skipped() {
        let entry: HealthEntry = serde_json::from_value(json!({
            "Service": { "ID": "ext", "Service": "ext", "Address": "db.example.com", "Port": 5432 },
        }))
        .unwrap();
        assert!(entry.into_catalog_entry().is_none());
    }
}
