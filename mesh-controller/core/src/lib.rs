#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod network;
pub mod registry;
pub mod service;
pub mod upstream;

pub use self::{
    network::NetworkAttachment,
    registry::{RegistryError, ServiceRegistry},
    service::{CatalogEntry, ServiceDescriptor},
    upstream::{UpstreamBinding, UpstreamParseError},
};
pub use macaddr::MacAddr6;

/// Tag attached to every service registered by this controller.
pub const MANAGED_BY_TAG: &str = "managed-by:ovs-servicemesh";
