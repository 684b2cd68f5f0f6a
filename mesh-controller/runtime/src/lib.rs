#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use ovs_mesh_controller_consul as consul;
pub use ovs_mesh_controller_core as core;
pub use ovs_mesh_controller_k8s_api as k8s;
pub use ovs_mesh_controller_k8s_pod as pod;
pub use ovs_mesh_controller_openflow as openflow;

mod args;
mod metrics;
mod pods;
mod reconcile;

pub use self::{
    args::Args,
    metrics::ReconcileMetrics,
    pods::{ClusterPods, PodSource},
    reconcile::{
        ApplyError, ContainerError, ContainerReport, DeferReason, PassError, PassOutcome,
        Reconciler, ServiceReport, SkipReason, Timeout, UpstreamError, UpstreamOutcome,
    },
};
