#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Derives mesh state from pod objects: which containers should be registered, what network
//! identity they have on the mesh switch, and the service descriptors that describe them.

mod descriptor;
mod lifecycle;
mod network;


pub use self::{
    descriptor::{build_descriptor, container_port, DescriptorBuildError},
    lifecycle::{
        container_phase, parse_bool, registration_intent, InvalidAnnotation, PodLifecyclePhase,
    },
    network::{find_attachment, network_attachment, NetworkNotFound},
};
use std::net::IpAddr;

/// Cluster-wide mesh settings that apply to every pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshSettings {
    /// The address callers target to reach their upstreams.
    pub virtual_ip: IpAddr,

    /// The network-status entry to use when a pod doesn't name one.
    pub default_network_name: Option<String>,
}
