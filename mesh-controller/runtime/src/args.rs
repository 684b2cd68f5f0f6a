use crate::{
    consul::{ConsulRegistry, Url},
    k8s::{self, watcher, ResourceExt},
    openflow::{OvsOfctl, Synthesizer},
    pod::MeshSettings,
    ClusterPods, ReconcileMetrics, Reconciler,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{net::IpAddr, path::PathBuf, sync::Arc};
use tokio::{sync::Semaphore, time::Duration};
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "ovs-mesh-controller",
    about = "Registers mesh pods in Consul and programs their upstream flows into Open vSwitch"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "ovs_mesh_controller=info,warn",
        env = "OVS_MESH_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address of the local Consul agent's HTTP API.
    #[clap(long, default_value = "http://localhost:8500")]
    consul_addr: Url,

    /// ACL token sent with every Consul request.
    #[clap(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,

    /// The address that callers use to reach their upstreams.
    #[clap(long, default_value = "10.1.1.254")]
    virtual_ip: IpAddr,

    /// The Open vSwitch bridge that mesh pods are attached to.
    #[clap(long, default_value = "br0")]
    bridge: String,

    #[clap(long, default_value = "ovs-ofctl")]
    ovs_ofctl: PathBuf,

    /// OpenFlow versions to use with the bridge (e.g. `OpenFlow13`).
    #[clap(long)]
    openflow_protocols: Option<String>,

    #[clap(long, default_value = "1")]
    conntrack_zone: u16,

    /// The network-status entry to use for pods that don't name their mesh network.
    #[clap(long)]
    default_network_name: Option<String>,

    #[clap(long, default_value = "5000")]
    call_timeout_ms: u64,

    #[clap(long, default_value = "16")]
    max_concurrent_reconciles: usize,

    /// Limits the watch to pods matching this label selector.
    #[clap(long)]
    pod_selector: Option<String>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            consul_addr,
            consul_token,
            virtual_ip,
            bridge,
            ovs_ofctl,
            openflow_protocols,
            conntrack_zone,
            default_network_name,
            call_timeout_ms,
            max_concurrent_reconciles,
            pod_selector,
        } = self;

        if max_concurrent_reconciles == 0 {
            bail!("--max-concurrent-reconciles must be at least 1");
        }

        let mut prom = <Registry>::default();
        let metrics = ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let registry = ConsulRegistry::new(consul_addr, consul_token)?;
        let mut switch = OvsOfctl::new(ovs_ofctl, bridge);
        if let Some(protocols) = openflow_protocols {
            switch = switch.with_protocols(protocols);
        }
        let settings = MeshSettings {
            virtual_ip,
            default_network_name,
        };
        let reconciler = Reconciler::new(
            Arc::new(ClusterPods::new(runtime.client())),
            Arc::new(registry),
            Arc::new(switch),
            settings,
        )
        .with_synthesizer(Synthesizer::new(conntrack_zone))
        .with_call_timeout(Duration::from_millis(call_timeout_ms));

        let mut watch = watcher::Config::default();
        if let Some(selector) = pod_selector.as_deref() {
            watch = watch.labels(selector);
        }
        let pods = runtime.watch_all::<k8s::Pod>(watch);
        tokio::spawn(
            watch_pods(
                Arc::new(reconciler),
                metrics,
                Arc::new(Semaphore::new(max_concurrent_reconciles)),
                pods,
            )
            .instrument(info_span!("pods")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Runs a reconciliation pass for every pod update, with at most `limit` passes in flight.
///
/// Deleted pods are not deregistered. Their registrations stay in the catalog, and resolution
/// passes over instances whose pod no longer exists.
///
/// A deferred upstream is only retried on the next event for the pod that declares it.
async fn watch_pods(
    reconciler: Arc<Reconciler>,
    metrics: ReconcileMetrics,
    limit: Arc<Semaphore>,
    events: impl Stream<Item = watcher::Event<k8s::Pod>>,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        let pod = match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => pod,
            watcher::Event::Delete(pod) => {
                debug!(ns = ?pod.namespace(), name = %pod.name_any(), "Pod deleted");
                continue;
            }
            watcher::Event::Init => {
                debug!("Watch restarted");
                continue;
            }
            watcher::Event::InitDone => {
                info!("Initial pods listed");
                continue;
            }
        };

        let Some(name) = pod.metadata.name else {
            continue;
        };
        let namespace = pod.metadata.namespace.unwrap_or_default();

        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let reconciler = reconciler.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let outcome = reconciler.reconcile(&namespace, &name).await;
            metrics.record(&outcome);
            drop(permit);
        });
    }
}
