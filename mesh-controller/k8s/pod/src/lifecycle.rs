use ovs_mesh_controller_k8s_api::{self as k8s, ResourceExt};

/// Where a container stands with respect to mesh registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PodLifecyclePhase {
    /// The pod hasn't opted in to registration.
    NotEligible,

    /// The pod has opted in but the container can't serve traffic yet.
    PendingRunning,

    /// The container is ready and should be registered.
    ReadyContainer,

    /// The pod or container has finished running (or the pod is being deleted).
    Terminated,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("annotation {annotation} has invalid boolean value {value:?}")]
pub struct InvalidAnnotation {
    pub annotation: &'static str,
    pub value: String,
}

/// Reads the pod's registration annotation. An absent annotation means the pod is not registered.
pub fn registration_intent(meta: &k8s::ObjectMeta) -> Result<bool, InvalidAnnotation> {
    match k8s::annotation(meta, k8s::REGISTER_ANNOTATION) {
        None => Ok(false),
        Some(value) => parse_bool(value).ok_or_else(|| InvalidAnnotation {
            annotation: k8s::REGISTER_ANNOTATION,
            value: value.to_string(),
        }),
    }
}

/// Parses the boolean spellings accepted by Go's `strconv.ParseBool`, which is what users of
/// Kubernetes annotations conventionally expect.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Computes a container's registration phase from its pod's state.
pub fn container_phase(
    pod: &k8s::Pod,
    container: &k8s::ContainerStatus,
) -> Result<PodLifecyclePhase, InvalidAnnotation> {
    if !registration_intent(&pod.metadata)? {
        return Ok(PodLifecyclePhase::NotEligible);
    }

    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(PodLifecyclePhase::Terminated);
    }

    let terminated = container
        .state
        .as_ref()
        .is_some_and(|s| s.terminated.is_some());
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    match phase {
        Some("Succeeded" | "Failed") => Ok(PodLifecyclePhase::Terminated),
        _ if terminated => Ok(PodLifecyclePhase::Terminated),
        Some(k8s::POD_RUNNING) if container.ready => Ok(PodLifecyclePhase::ReadyContainer),
        _ => {
            tracing::trace!(pod = %pod.name_any(), container = %container.name, ?phase, "Container not ready");
            Ok(PodLifecyclePhase::PendingRunning)
        }
    }
}
