#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod network_status;

pub use self::network_status::NetworkStatus;
pub use k8s_openapi::api::{
    self,
    core::v1::{Container, ContainerPort, ContainerStatus, Pod, PodSpec, PodStatus},
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Error,
};

/// Boolean annotation that opts a pod in to mesh registration.
pub const REGISTER_ANNOTATION: &str = "ovs.servicemesh.arkadiuss.dev/consul-register";

/// Comma-separated `name:port` list of the pod's upstream dependencies.
pub const UPSTREAMS_ANNOTATION: &str = "ovs.servicemesh.arkadiuss.dev/upstreams";

/// Names the entry of the network-status annotation that is attached to the mesh switch.
pub const NETWORK_NAME_ANNOTATION: &str = "ovs.servicemesh.arkadiuss.dev/ovs-cni-network-name";

/// Set by Multus on every pod with secondary networks.
pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";

/// The label naming the service a pod belongs to.
pub const APP_LABEL: &str = "app";

/// The `status.phase` of a pod whose containers have all been started.
pub const POD_RUNNING: &str = "Running";

/// Returns the value of an annotation, if set.
pub fn annotation<'m>(meta: &'m ObjectMeta, key: &str) -> Option<&'m str> {
    meta.annotations.as_ref()?.get(key).map(String::as_str)
}

/// Returns the value of a label, if set.
pub fn label<'m>(meta: &'m ObjectMeta, key: &str) -> Option<&'m str> {
    meta.labels.as_ref()?.get(key).map(String::as_str)
}
