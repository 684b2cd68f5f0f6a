use ovs_mesh_controller_core::{MacAddr6, NetworkAttachment};
use ovs_mesh_controller_k8s_api::{
    self as k8s,
    network_status::{self, NetworkStatus},
};

#[derive(Debug, thiserror::Error)]
pub enum NetworkNotFound {
    #[error("pod does not name its mesh network")]
    Unnamed,

    #[error(transparent)]
    Status(#[from] network_status::Error),

    #[error("network {0:?} is not attached to the pod")]
    NotAttached(String),

    #[error("network {0:?} has no addresses")]
    NoAddress(String),

    #[error("network {name:?} has an invalid address {ip:?}")]
    InvalidAddress {
        name: String,
        ip: String,
        #[source]
        error: std::net::AddrParseError,
    },

    #[error("network {0:?} has no MAC address")]
    MissingMac(String),

    #[error("network {name:?} has an invalid MAC address {mac:?}")]
    InvalidMac {
        name: String,
        mac: String,
        #[source]
        error: macaddr::ParseError,
    },
}

/// Finds the pod's attachment to the mesh network.
///
/// The network is named by the pod's network-name annotation, or by `default_name` when the pod
/// doesn't set one.
pub fn network_attachment(
    meta: &k8s::ObjectMeta,
    default_name: Option<&str>,
) -> Result<NetworkAttachment, NetworkNotFound> {
    let name = k8s::annotation(meta, k8s::NETWORK_NAME_ANNOTATION)
        .or(default_name)
        .ok_or(NetworkNotFound::Unnamed)?;
    let statuses = network_status::from_metadata(meta)?;
    find_attachment(&statuses, name)
}

/// Returns the first status entry named exactly `name`.
///
/// Later entries with the same name are never consulted, even when the first is malformed.
pub fn find_attachment(
    statuses: &[NetworkStatus],
    name: &str,
) -> Result<NetworkAttachment, NetworkNotFound> {
    let status = statuses
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| NetworkNotFound::NotAttached(name.to_string()))?;

    let addresses = status
        .ips
        .iter()
        .map(|ip| {
            ip.parse().map_err(|error| NetworkNotFound::InvalidAddress {
                name: name.to_string(),
                ip: ip.clone(),
                error,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mac = status
        .mac
        .as_deref()
        .ok_or_else(|| NetworkNotFound::MissingMac(name.to_string()))?;
    let mac = mac
        .parse::<MacAddr6>()
        .map_err(|error| NetworkNotFound::InvalidMac {
            name: name.to_string(),
            mac: mac.to_string(),
            error,
        })?;

    NetworkAttachment::new(name, addresses, mac)
        .ok_or_else(|| NetworkNotFound::NoAddress(name.to_string()))
}
