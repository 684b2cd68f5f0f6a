use crate::{
    core::{CatalogEntry, RegistryError, ServiceDescriptor, ServiceRegistry, UpstreamBinding},
    k8s::{self, ResourceExt},
    openflow::{
        Destination, FirstEntry, FlowSwitch, SelectDestination, SwitchError, SynthesisError,
        Synthesizer,
    },
    pod::{
        build_descriptor, container_phase, network_attachment, registration_intent,
        DescriptorBuildError, InvalidAnnotation, MeshSettings, NetworkNotFound,
        PodLifecyclePhase,
    },
    PodSource,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, instrument, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Brings the registry and the switch in line with a single pod.
///
/// A pass is a straight line: fetch the pod, register each of its ready containers, then install
/// flows for each container's upstreams. Nothing is retried; a later event for the pod (or for an
/// upstream's pod) runs another pass.
pub struct Reconciler {
    pods: Arc<dyn PodSource>,
    registry: Arc<dyn ServiceRegistry>,
    switch: Arc<dyn FlowSwitch>,
    select: Arc<dyn SelectDestination>,
    synthesizer: Synthesizer,
    settings: MeshSettings,
    call_timeout: Duration,
}

#[derive(Debug)]
pub enum PassOutcome {
    /// The pod no longer exists.
    Gone,
    Skipped(SkipReason),
    Failed(PassError),
    Registered(Vec<ContainerReport>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NotRequested,
    Terminating,
    NotRunning,
    NoReadyContainers,
}

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("failed to fetch pod: {0}")]
    Fetch(#[source] anyhow::Error),

    #[error(transparent)]
    InvalidAnnotation(#[from] InvalidAnnotation),

    #[error("fetching pod {0}")]
    Timeout(#[from] Timeout),
}

/// A call to the cluster, the registry or the switch didn't complete in time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {0:?}")]
pub struct Timeout(pub Duration);

#[derive(Debug)]
pub struct ContainerReport {
    pub container: String,
    pub outcome: Result<ServiceReport, ContainerError>,
}

#[derive(Debug)]
pub struct ServiceReport {
    pub service_id: String,

    /// One outcome per declared upstream, in declaration order.
    pub upstreams: Vec<(UpstreamBinding, UpstreamOutcome)>,
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorBuildError),

    #[error("failed to register service: {0}")]
    Register(#[source] RegistryError),

    #[error("registering service {0}")]
    Timeout(#[from] Timeout),
}

#[derive(Debug)]
pub enum UpstreamOutcome {
    /// Flows redirecting the binding to `destination` are installed.
    Installed { destination: String },

    /// The upstream can't be resolved right now.
    Deferred(DeferReason),

    Failed(UpstreamError),
}

#[derive(Debug, thiserror::Error)]
pub enum DeferReason {
    #[error("no healthy instances")]
    NoInstances,

    #[error(transparent)]
    Registry(RegistryError),

    #[error("resolving upstream {0}")]
    Timeout(Timeout),
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("destination {service_id} is not backed by a mesh pod")]
    UnknownPod { service_id: String },

    #[error("destination pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    #[error("failed to fetch destination pod: {0}")]
    Fetch(#[source] anyhow::Error),

    #[error("fetching destination pod {0}")]
    Timeout(Timeout),

    #[error("destination has no mesh network: {0}")]
    Network(#[source] NetworkNotFound),

    #[error(transparent)]
    Synthesis(SynthesisError),

    #[error(transparent)]
    Apply(ApplyError),
}

/// Installing a service's flows failed. Every binding in the set shares the failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to apply flows: {0}")]
    Switch(Arc<SwitchError>),

    #[error("applying flows {0}")]
    Timeout(Timeout),
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        pods: Arc<dyn PodSource>,
        registry: Arc<dyn ServiceRegistry>,
        switch: Arc<dyn FlowSwitch>,
        settings: MeshSettings,
    ) -> Self {
        Self {
            pods,
            registry,
            switch,
            select: Arc::new(FirstEntry),
            synthesizer: Synthesizer::default(),
            settings,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_select(mut self, select: Arc<dyn SelectDestination>) -> Self {
        self.select = select;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Synthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Bounds every cluster, registry and switch call made during a pass.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[instrument(skip_all, fields(ns = %namespace, name = %name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> PassOutcome {
        let pod = match self.bounded(self.pods.get(namespace, name)).await {
            Ok(Ok(Some(pod))) => pod,
            Ok(Ok(None)) => {
                debug!("Pod not found");
                return PassOutcome::Gone;
            }
            Ok(Err(error)) => return self.failed(PassError::Fetch(error)),
            Err(timeout) => return self.failed(timeout.into()),
        };

        self.reconcile_pod(&pod).await
    }

    async fn reconcile_pod(&self, pod: &k8s::Pod) -> PassOutcome {
        match registration_intent(&pod.metadata) {
            Ok(true) => {}
            Ok(false) => return self.skipped(SkipReason::NotRequested),
            Err(error) => return self.failed(error.into()),
        }

        if pod.metadata.deletion_timestamp.is_some() {
            return self.skipped(SkipReason::Terminating);
        }
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase != Some(k8s::POD_RUNNING) {
            return self.skipped(SkipReason::NotRunning);
        }

        let ready = pod
            .status
            .iter()
            .flat_map(|s| s.container_statuses.iter().flatten())
            .filter(|c| {
                matches!(
                    container_phase(pod, c),
                    Ok(PodLifecyclePhase::ReadyContainer)
                )
            })
            .collect::<Vec<_>>();
        if ready.is_empty() {
            return self.skipped(SkipReason::NoReadyContainers);
        }

        let mut reports = Vec::with_capacity(ready.len());
        for container in ready {
            let outcome = self.register_container(pod, container).await;
            if let Err(error) = &outcome {
                warn!(container = %container.name, %error, "Failed to register container");
            }
            reports.push(ContainerReport {
                container: container.name.clone(),
                outcome,
            });
        }
        PassOutcome::Registered(reports)
    }

    async fn register_container(
        &self,
        pod: &k8s::Pod,
        container: &k8s::ContainerStatus,
    ) -> Result<ServiceReport, ContainerError> {
        let svc = build_descriptor(pod, container, &self.settings)?;
        self.bounded(self.registry.upsert(&svc))
            .await?
            .map_err(ContainerError::Register)?;
        info!(
            id = %svc.id,
            service = %svc.name,
            address = %svc.address,
            port = svc.port,
            "Registered service"
        );

        let upstreams = self.install_upstreams(&svc).await;
        Ok(ServiceReport {
            service_id: svc.id,
            upstreams,
        })
    }

    /// Resolves each of the service's upstreams and installs their flows in a single switch call.
    async fn install_upstreams(
        &self,
        svc: &ServiceDescriptor,
    ) -> Vec<(UpstreamBinding, UpstreamOutcome)> {
        let mut outcomes = svc.upstreams.iter().map(|_| None).collect::<Vec<_>>();

        let mut resolved = Vec::with_capacity(svc.upstreams.len());
        for (i, binding) in svc.upstreams.iter().enumerate() {
            match self.destination(binding).await {
                Ok(dst) => resolved.push((i, dst)),
                Err(outcome) => outcomes[i] = Some(outcome),
            }
        }

        let synthesis = self.synthesizer.synthesize(
            svc.address,
            resolved.iter().map(|(i, dst)| (&svc.upstreams[*i], dst)),
        );

        let applied = if synthesis.rules.is_empty() {
            Ok(())
        } else {
            match self.bounded(self.switch.apply(&synthesis.rules)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(ApplyError::Switch(Arc::new(error))),
                Err(timeout) => Err(ApplyError::Timeout(timeout)),
            }
        };

        for ((i, dst), (_, result)) in resolved.iter().zip(synthesis.outcomes) {
            outcomes[*i] = Some(match (result, &applied) {
                (Err(error), _) => UpstreamOutcome::Failed(UpstreamError::Synthesis(error)),
                (Ok(()), Err(error)) => UpstreamOutcome::Failed(UpstreamError::Apply(error.clone())),
                (Ok(()), Ok(())) => UpstreamOutcome::Installed {
                    destination: dst.entry.service_id.clone(),
                },
            });
        }

        svc.upstreams
            .iter()
            .zip(outcomes)
            .filter_map(|(binding, outcome)| {
                let outcome = outcome?;
                let upstream = &binding.destination_service;
                match &outcome {
                    UpstreamOutcome::Installed { destination } => {
                        info!(%upstream, %destination, port = %binding.local_bind_port, "Installed upstream")
                    }
                    UpstreamOutcome::Deferred(reason) => {
                        info!(%upstream, %reason, "Deferred upstream")
                    }
                    UpstreamOutcome::Failed(error) => {
                        warn!(%upstream, %error, "Failed to install upstream")
                    }
                }
                Some((binding.clone(), outcome))
            })
            .collect()
    }

    /// Picks the instance a binding is redirected to and finds its address on the mesh switch.
    async fn destination(&self, binding: &UpstreamBinding) -> Result<Destination, UpstreamOutcome> {
        let mut candidates = match self
            .bounded(self.registry.resolve(&binding.destination_service))
            .await
        {
            Ok(Ok(entries)) => entries,
            Ok(Err(error)) => return Err(UpstreamOutcome::Deferred(DeferReason::Registry(error))),
            Err(timeout) => return Err(UpstreamOutcome::Deferred(DeferReason::Timeout(timeout))),
        };

        // Registrations outlive their pods, so instances whose pod is gone are dropped and the
        // selection is made again from what remains.
        let mut stale = None;
        while let Some(entry) = self.select.select(&candidates).cloned() {
            match self.destination_pod(&entry).await {
                Ok(pod) => {
                    let attachment = network_attachment(
                        &pod.metadata,
                        self.settings.default_network_name.as_deref(),
                    )
                    .map_err(|e| UpstreamOutcome::Failed(UpstreamError::Network(e)))?;
                    return Ok(Destination { entry, attachment });
                }
                Err(error @ UpstreamError::PodNotFound { .. }) => {
                    debug!(service_id = %entry.service_id, %error, "Skipping stale instance");
                    candidates.retain(|e| e.service_id != entry.service_id);
                    stale = Some(error);
                }
                Err(error) => return Err(UpstreamOutcome::Failed(error)),
            }
        }

        Err(match stale {
            Some(error) => UpstreamOutcome::Failed(error),
            None => UpstreamOutcome::Deferred(DeferReason::NoInstances),
        })
    }

    async fn destination_pod(&self, entry: &CatalogEntry) -> Result<k8s::Pod, UpstreamError> {
        let (namespace, name) = entry.pod().ok_or_else(|| UpstreamError::UnknownPod {
            service_id: entry.service_id.clone(),
        })?;
        match self.bounded(self.pods.get(namespace, name)).await {
            Ok(Ok(Some(pod))) => {
                debug!(pod = %pod.name_any(), "Found destination pod");
                Ok(pod)
            }
            Ok(Ok(None)) => Err(UpstreamError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Ok(Err(error)) => Err(UpstreamError::Fetch(error)),
            Err(timeout) => Err(UpstreamError::Timeout(timeout)),
        }
    }

    async fn bounded<F: Future>(&self, call: F) -> Result<F::Output, Timeout> {
        time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| Timeout(self.call_timeout))
    }

    fn skipped(&self, reason: SkipReason) -> PassOutcome {
        debug!(?reason, "Skipping pod");
        PassOutcome::Skipped(reason)
    }

    fn failed(&self, error: PassError) -> PassOutcome {
        warn!(%error, "Reconciliation failed");
        PassOutcome::Failed(error)
    }
}

// === impl PassOutcome ===

impl PassOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Gone => "gone",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
            Self::Registered(_) => "registered",
        }
    }

    /// All upstream outcomes of the pass, across containers.
    pub fn upstreams(&self) -> impl Iterator<Item = &(UpstreamBinding, UpstreamOutcome)> {
        let reports = match self {
            Self::Registered(reports) => reports.as_slice(),
            _ => &[],
        };
        reports
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .flat_map(|svc| svc.upstreams.iter())
    }
}

// === impl UpstreamOutcome ===

impl UpstreamOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Installed { .. } => "installed",
            Self::Deferred(_) => "deferred",
            Self::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests;
