use crate::{network::network_attachment, MeshSettings, NetworkNotFound};
use ovs_mesh_controller_core::{
    service::{META_POD_NAME, META_POD_NAMESPACE},
    upstream::parse_upstreams,
    ServiceDescriptor, UpstreamParseError, MANAGED_BY_TAG,
};
use ovs_mesh_controller_k8s_api::{self as k8s, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, thiserror::Error)]
pub enum DescriptorBuildError {
    #[error("pod has no `app` label")]
    MissingServiceName,

    #[error("pod has no name")]
    MissingPodName,

    #[error("no mesh network: {0}")]
    Network(#[from] NetworkNotFound),

    #[error("invalid upstreams annotation: {0}")]
    InvalidUpstreams(#[from] UpstreamParseError),

    #[error("container {container} declares invalid port {port}")]
    InvalidContainerPort { container: String, port: i32 },
}

/// Describes a pod's container as a mesh service.
///
/// Fails if the pod has no service name or mesh address, or declares malformed upstreams; a
/// container without ports is still described, with port 0.
pub fn build_descriptor(
    pod: &k8s::Pod,
    container: &k8s::ContainerStatus,
    settings: &MeshSettings,
) -> Result<ServiceDescriptor, DescriptorBuildError> {
    let pod_name = pod
        .metadata
        .name
        .as_deref()
        .ok_or(DescriptorBuildError::MissingPodName)?;

    let name = k8s::label(&pod.metadata, k8s::APP_LABEL)
        .filter(|n| !n.is_empty())
        .ok_or(DescriptorBuildError::MissingServiceName)?;

    let port = container_port(pod, &container.name)?;

    let attachment =
        network_attachment(&pod.metadata, settings.default_network_name.as_deref())?;

    let upstreams = match k8s::annotation(&pod.metadata, k8s::UPSTREAMS_ANNOTATION) {
        Some(spec) => parse_upstreams(spec, settings.virtual_ip)?,
        None => Vec::new(),
    };

    let mut meta = BTreeMap::new();
    if let Some(ns) = pod.namespace() {
        meta.insert(META_POD_NAMESPACE.to_string(), ns);
    }
    meta.insert(META_POD_NAME.to_string(), pod_name.to_string());

    Ok(ServiceDescriptor {
        id: ServiceDescriptor::service_id(pod_name, &container.name),
        name: name.to_string(),
        address: attachment.primary_address(),
        port,
        tags: BTreeSet::from([MANAGED_BY_TAG.to_string()]),
        meta,
        upstreams,
    })
}

/// Returns the first port declared by the named container, or 0 if it declares none.
pub fn container_port(pod: &k8s::Pod, container: &str) -> Result<u16, DescriptorBuildError> {
    let declared = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .filter(|c| c.name == container)
        .find_map(|c| c.ports.as_ref()?.first());

    match declared {
        None => Ok(0),
        Some(p) => u16::try_from(p.container_port).map_err(|_| {
            DescriptorBuildError::InvalidContainerPort {
                container: container.to_string(),
                port: p.container_port,
            }
        }),
    }
}
