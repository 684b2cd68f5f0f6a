use crate::{annotation, ObjectMeta, NETWORK_STATUS_ANNOTATION};
use serde::{Deserialize, Serialize};

/// One entry of the Multus `k8s.v1.cni.cncf.io/network-status` annotation.
///
/// Only the fields the mesh needs are modeled; the rest of the entry is ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("network-status annotation is not set")]
    Missing,

    #[error("network-status annotation is invalid: {0}")]
    Invalid(#[source] serde_json::Error),
}

/// Reads the network-status annotation, preserving the order the CNI plugin reported.
pub fn from_metadata(meta: &ObjectMeta) -> Result<Vec<NetworkStatus>, Error> {
    let json = annotation(meta, NETWORK_STATUS_ANNOTATION).ok_or(Error::Missing)?;
    serde_json::from_str(json).map_err(Error::Invalid)
}
