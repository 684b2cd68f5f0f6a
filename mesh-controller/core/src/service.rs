use crate::UpstreamBinding;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

/// Service metadata key holding the namespace of the pod that backs an instance.
pub const META_POD_NAMESPACE: &str = "k8s-namespace";

/// Service metadata key holding the name of the pod that backs an instance.
pub const META_POD_NAME: &str = "k8s-pod";

/// A container's registration, as sent to the service registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// `<pod>-<container>`; unique per container.
    pub id: String,
    pub name: String,
    pub address: IpAddr,

    /// The container's first declared port, or 0 when it declares none.
    pub port: u16,
    pub tags: BTreeSet<String>,
    pub meta: BTreeMap<String, String>,
    pub upstreams: Vec<UpstreamBinding>,
}

/// A live, healthy service instance as reported by the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    pub service_id: String,
    pub service_name: String,
    pub address: IpAddr,
    pub port: u16,
    pub upstreams: Vec<UpstreamBinding>,
    pub meta: BTreeMap<String, String>,
}

// === impl ServiceDescriptor ===

impl ServiceDescriptor {
    pub fn service_id(pod: &str, container: &str) -> String {
        format!("{pod}-{container}")
    }
}

// === impl CatalogEntry ===

impl CatalogEntry {
    /// The `(namespace, name)` of the pod backing this instance, if it was registered by this
    /// controller.
    pub fn pod(&self) -> Option<(&str, &str)> {
        let ns = self.meta.get(META_POD_NAMESPACE)?;
        let name = self.meta.get(META_POD_NAME)?;
        Some((ns.as_str(), name.as_str()))
    }
}
