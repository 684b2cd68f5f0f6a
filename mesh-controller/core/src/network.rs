use macaddr::MacAddr6;
use std::net::IpAddr;

/// A pod's identity on one of its secondary (CNI-attached) networks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAttachment {
    name: String,

    /// Addresses in the order reported by the CNI plugin. Never empty.
    addresses: Vec<IpAddr>,

    mac: MacAddr6,
}

// === impl NetworkAttachment ===

impl NetworkAttachment {
    /// Returns `None` if no address is given: an attachment without an address
    /// can't carry service traffic.
    pub fn new(name: impl Into<String>, addresses: Vec<IpAddr>, mac: MacAddr6) -> Option<Self> {
        if addresses.is_empty() {
            return None;
        }
        Some(Self {
            name: name.into(),
            addresses,
            mac,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// The address used for service traffic.
    pub fn primary_address(&self) -> IpAddr {
        self.addresses[0]
    }

    pub fn mac(&self) -> MacAddr6 {
        self.mac
    }
}
