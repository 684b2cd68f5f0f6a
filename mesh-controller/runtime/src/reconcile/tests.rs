use super::*;
use crate::{
    core::RegistryError,
    openflow::{FlowSet, SwitchError},
};
use maplit::btreemap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};

const NETWORK: &str = "default/ovs-net";

#[derive(Default)]
struct Pods(Mutex<HashMap<(String, String), k8s::Pod>>);

/// Never answers.
struct Hanging;

#[derive(Default)]
struct Registry {
    catalog: Mutex<BTreeMap<String, Vec<CatalogEntry>>>,
    upserts: Mutex<Vec<ServiceDescriptor>>,
    reject: Mutex<HashSet<String>>,
    resolve_unavailable: bool,
}

#[derive(Default)]
struct Switch {
    applied: Mutex<Vec<FlowSet>>,
    fail: bool,
}

#[async_trait::async_trait]
impl PodSource for Pods {
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<Option<k8s::Pod>> {
        let key = (namespace.to_string(), name.to_string());
        Ok(self.0.lock().get(&key).cloned())
    }
}

#[async_trait::async_trait]
impl PodSource for Hanging {
    async fn get(&self, _: &str, _: &str) -> anyhow::Result<Option<k8s::Pod>> {
        std::future::pending().await
    }
}

#[async_trait::async_trait]
impl ServiceRegistry for Registry {
    async fn upsert(&self, svc: &ServiceDescriptor) -> Result<(), RegistryError> {
        if self.reject.lock().contains(&svc.id) {
            return Err(RegistryError::Rejected {
                status: 500,
                message: "Invalid service".to_string(),
            });
        }
        self.upserts.lock().push(svc.clone());

        // Instances pass their health checks as soon as they're registered.
        let entry = CatalogEntry {
            service_id: svc.id.clone(),
            service_name: svc.name.clone(),
            address: svc.address,
            port: svc.port,
            upstreams: svc.upstreams.clone(),
            meta: svc.meta.clone(),
        };
        let mut catalog = self.catalog.lock();
        let instances = catalog.entry(svc.name.clone()).or_default();
        instances.retain(|e| e.service_id != svc.id);
        instances.push(entry);
        Ok(())
    }

    async fn resolve(&self, service_name: &str) -> Result<Vec<CatalogEntry>, RegistryError> {
        if self.resolve_unavailable {
            return Err(RegistryError::Unavailable("connection refused".into()));
        }
        Ok(self
            .catalog
            .lock()
            .get(service_name)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl FlowSwitch for Switch {
    async fn apply(&self, rules: &FlowSet) -> Result<(), SwitchError> {
        if self.fail {
            return Err(SwitchError::Spawn {
                program: "ovs-ofctl".to_string(),
                error: std::io::ErrorKind::NotFound.into(),
            });
        }
        self.applied.lock().push(rules.clone());
        Ok(())
    }
}

impl Pods {
    fn insert(&self, pod: k8s::Pod) {
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        self.0.lock().insert(key, pod);
    }

    fn remove(&self, name: &str) {
        self.0
            .lock()
            .remove(&("default".to_string(), name.to_string()));
    }
}

struct Fixture {
    pods: Arc<Pods>,
    registry: Arc<Registry>,
    switch: Arc<Switch>,
    reconciler: Reconciler,
}

impl Fixture {
    fn new(registry: Registry, switch: Switch) -> Self {
        let pods = Arc::new(Pods::default());
        let registry = Arc::new(registry);
        let switch = Arc::new(switch);
        let reconciler = Reconciler::new(
            pods.clone(),
            registry.clone(),
            switch.clone(),
            MeshSettings {
                virtual_ip: "10.1.1.254".parse().unwrap(),
                default_network_name: None,
            },
        );
        Self {
            pods,
            registry,
            switch,
            reconciler,
        }
    }

    async fn reconcile(&self, name: &str) -> PassOutcome {
        self.reconciler.reconcile("default", name).await
    }

    fn applied(&self) -> Vec<FlowSet> {
        self.switch.applied.lock().clone()
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new(Registry::default(), Switch::default())
    }
}

/// A running, mesh-registered pod with a single address on the mesh network.
fn mk_pod(
    name: &str,
    app: &str,
    ip: &str,
    mac: &str,
    containers: impl IntoIterator<Item = (&'static str, i32)>,
) -> k8s::Pod {
    let network_status = serde_json::json!([
        { "name": "kindnet", "interface": "eth0", "ips": ["10.244.0.9"], "default": true },
        { "name": NETWORK, "interface": "net1", "ips": [ip], "mac": mac },
    ]);

    let (containers, statuses): (Vec<_>, Vec<_>) = containers
        .into_iter()
        .map(|(name, port)| {
            let container = k8s::Container {
                name: name.to_string(),
                ports: Some(vec![k8s::ContainerPort {
                    container_port: port,
                    ..Default::default()
                }]),
                ..Default::default()
            };
            let status = k8s::ContainerStatus {
                name: name.to_string(),
                ready: true,
                ..Default::default()
            };
            (container, status)
        })
        .unzip();

    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            labels: Some(btreemap! { "app".to_string() => app.to_string() }),
            annotations: Some(btreemap! {
                k8s::REGISTER_ANNOTATION.to_string() => "true".to_string(),
                k8s::NETWORK_NAME_ANNOTATION.to_string() => NETWORK.to_string(),
                k8s::NETWORK_STATUS_ANNOTATION.to_string() => network_status.to_string(),
            }),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            containers,
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(statuses),
            ..Default::default()
        }),
    }
}

fn web_pod(upstreams: Option<&str>) -> k8s::Pod {
    let mut pod = mk_pod(
        "web-0",
        "web",
        "10.0.0.5",
        "aa:bb:cc:dd:ee:05",
        [("app", 8080)],
    );
    if let Some(upstreams) = upstreams {
        pod.annotations_mut()
            .insert(k8s::UPSTREAMS_ANNOTATION.to_string(), upstreams.to_string());
    }
    pod
}

fn cache_pod() -> k8s::Pod {
    mk_pod(
        "cache-0",
        "cache",
        "10.0.0.9",
        "11:22:33:44:55:66",
        [("redis", 6379)],
    )
}

fn db_pod() -> k8s::Pod {
    mk_pod(
        "db-0",
        "db",
        "10.0.0.10",
        "11:22:33:44:55:77",
        [("postgres", 5432)],
    )
}

fn reports(outcome: PassOutcome) -> Vec<ContainerReport> {
    match outcome {
        PassOutcome::Registered(reports) => reports,
        outcome => panic!("expected registration, got {outcome:?}"),
    }
}

fn service(outcome: PassOutcome) -> ServiceReport {
    let mut reports = reports(outcome);
    assert_eq!(reports.len(), 1);
    reports.remove(0).outcome.expect("container must register")
}

/// Registers the given pods as upstream instances.
async fn register(fx: &Fixture, pods: impl IntoIterator<Item = k8s::Pod>) {
    for pod in pods {
        let name = pod.name_any();
        fx.pods.insert(pod);
        service(fx.reconcile(&name).await);
    }
}

#[tokio::test]
async fn registers_ready_container() {
    let fx = Fixture::default();
    fx.pods.insert(web_pod(None));

    let svc = service(fx.reconcile("web-0").await);
    assert_eq!(svc.service_id, "web-0-app");
    assert!(svc.upstreams.is_empty());

    let upserts = fx.registry.upserts.lock().clone();
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].id, "web-0-app");
    assert_eq!(upserts[0].name, "web");
    assert_eq!(upserts[0].address, "10.0.0.5".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(upserts[0].port, 8080);
    assert!(upserts[0].tags.contains("managed-by:ovs-servicemesh"));

    // Nothing to install without upstreams.
    assert!(fx.applied().is_empty());
}

#[tokio::test]
async fn installs_upstream_flows() {
    let fx = Fixture::default();
    register(&fx, [cache_pod()]).await;
    fx.pods.insert(web_pod(Some("cache:6379")));

    let svc = service(fx.reconcile("web-0").await);
    assert_eq!(svc.upstreams.len(), 1);
    let (binding, outcome) = &svc.upstreams[0];
    assert_eq!(binding.destination_service, "cache");
    assert!(
        matches!(outcome, UpstreamOutcome::Installed { destination } if destination == "cache-0-redis"),
        "{outcome:?}"
    );

    let applied = fx.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(
        applied[0].to_string(),
        "table=0,priority=60,tcp,nw_dst=10.1.1.254,tp_dst=6379,actions=ct(commit,zone=1,nat(dst=10.0.0.9:6379)),mod_dl_dst:11:22:33:44:55:66,normal\n\
         table=0,priority=50,tcp,ct_state=-trk,actions=ct(table=0,zone=1,nat)\n\
         table=0,priority=50,tcp,ct_state=+trk+est,ct_zone=1,nw_dst=10.0.0.5,actions=normal\n"
    );
}

#[tokio::test]
async fn repeated_passes_are_idempotent() {
    let fx = Fixture::default();
    register(&fx, [cache_pod()]).await;
    fx.pods.insert(web_pod(Some("cache:6379")));

    service(fx.reconcile("web-0").await);
    service(fx.reconcile("web-0").await);

    let applied = fx.applied();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0], applied[1]);
    assert_eq!(fx.registry.catalog.lock()["web"].len(), 1);
}

#[tokio::test]
async fn defers_unresolved_upstream() {
    let fx = Fixture::default();
    fx.pods.insert(web_pod(Some("cache:6379")));

    let svc = service(fx.reconcile("web-0").await);
    assert!(matches!(
        svc.upstreams[0].1,
        UpstreamOutcome::Deferred(DeferReason::NoInstances)
    ));

    // The service itself is still registered, and no flows are installed.
    assert_eq!(fx.registry.upserts.lock().len(), 1);
    assert!(fx.applied().is_empty());
}

#[tokio::test]
async fn defers_when_registry_is_unavailable() {
    let fx = Fixture::new(
        Registry {
            resolve_unavailable: true,
            ..Default::default()
        },
        Switch::default(),
    );
    fx.pods.insert(web_pod(Some("cache:6379")));

    let svc = service(fx.reconcile("web-0").await);
    assert!(matches!(
        svc.upstreams[0].1,
        UpstreamOutcome::Deferred(DeferReason::Registry(RegistryError::Unavailable(_)))
    ));
    assert!(fx.applied().is_empty());
}

#[tokio::test]
async fn isolates_upstream_failures() {
    let fx = Fixture::default();
    register(&fx, [cache_pod(), db_pod()]).await;
    // The cache is still in the catalog, but its pod is gone.
    fx.pods.remove("cache-0");
    fx.pods.insert(web_pod(Some("cache:6379,db:5432")));

    let svc = service(fx.reconcile("web-0").await);
    let outcomes = svc
        .upstreams
        .iter()
        .map(|(b, o)| (b.destination_service.as_str(), o.label()))
        .collect::<Vec<_>>();
    assert_eq!(outcomes, [("cache", "failed"), ("db", "installed")]);
    assert!(matches!(
        svc.upstreams[0].1,
        UpstreamOutcome::Failed(UpstreamError::PodNotFound { .. })
    ));

    let applied = fx.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].len(), 3);
}

#[tokio::test]
async fn replaced_destination_pod_is_selected() {
    let fx = Fixture::default();
    let replacement = mk_pod(
        "cache-1",
        "cache",
        "10.0.0.11",
        "11:22:33:44:55:88",
        [("redis", 6379)],
    );
    register(&fx, [cache_pod(), replacement]).await;
    // cache-0 stays registered ahead of its replacement.
    fx.pods.remove("cache-0");
    fx.pods.insert(web_pod(Some("cache:6379")));

    for _ in 0..3 {
        let svc = service(fx.reconcile("web-0").await);
        assert!(
            matches!(&svc.upstreams[0].1, UpstreamOutcome::Installed { destination } if destination == "cache-1-redis"),
            "{:?}",
            svc.upstreams[0].1
        );
    }

    let applied = fx.applied();
    assert_eq!(applied.len(), 3);
    assert!(applied[0]
        .to_string()
        .contains("nat(dst=10.0.0.11:6379)),mod_dl_dst:11:22:33:44:55:88"));
    assert_eq!(fx.registry.catalog.lock()["cache"].len(), 2);
}

#[tokio::test]
async fn apply_failure_fails_every_binding() {
    let fx = Fixture::new(
        Registry::default(),
        Switch {
            fail: true,
            ..Default::default()
        },
    );
    register(&fx, [cache_pod(), db_pod()]).await;
    fx.pods.insert(web_pod(Some("cache:6379,db:5432")));

    let svc = service(fx.reconcile("web-0").await);
    assert_eq!(svc.upstreams.len(), 2);
    for (_, outcome) in &svc.upstreams {
        assert!(
            matches!(
                outcome,
                UpstreamOutcome::Failed(UpstreamError::Apply(ApplyError::Switch(_)))
            ),
            "{outcome:?}"
        );
    }
}

#[tokio::test]
async fn unexposed_destination_is_not_installed() {
    let fx = Fixture::default();
    // The cache container declares no ports, so it registers with port 0.
    let mut cache = cache_pod();
    if let Some(spec) = cache.spec.as_mut() {
        spec.containers[0].ports = None;
    }
    register(&fx, [cache]).await;
    fx.pods.insert(web_pod(Some("cache:6379")));

    let svc = service(fx.reconcile("web-0").await);
    assert!(matches!(
        svc.upstreams[0].1,
        UpstreamOutcome::Failed(UpstreamError::Synthesis(SynthesisError::ZeroPort { .. }))
    ));
    assert!(fx.applied().is_empty());
}

#[tokio::test]
async fn isolates_container_failures() {
    let fx = Fixture::default();
    fx.registry.reject.lock().insert("web-0-app".to_string());
    fx.pods.insert(mk_pod(
        "web-0",
        "web",
        "10.0.0.5",
        "aa:bb:cc:dd:ee:05",
        [("app", 8080), ("metrics", 9090)],
    ));

    let reports = reports(fx.reconcile("web-0").await);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].container, "app");
    assert!(matches!(
        reports[0].outcome,
        Err(ContainerError::Register(RegistryError::Rejected { status: 500, .. }))
    ));
    assert_eq!(reports[1].container, "metrics");
    assert_eq!(
        reports[1].outcome.as_ref().unwrap().service_id,
        "web-0-metrics"
    );
}

#[tokio::test]
async fn descriptor_failure_skips_registration() {
    let fx = Fixture::default();
    let mut pod = web_pod(None);
    pod.labels_mut().clear();
    fx.pods.insert(pod);

    let reports = reports(fx.reconcile("web-0").await);
    assert!(matches!(
        reports[0].outcome,
        Err(ContainerError::Descriptor(DescriptorBuildError::MissingServiceName))
    ));
    assert!(fx.registry.upserts.lock().is_empty());
}

#[tokio::test]
async fn only_ready_containers_register() {
    let fx = Fixture::default();
    let mut pod = mk_pod(
        "web-0",
        "web",
        "10.0.0.5",
        "aa:bb:cc:dd:ee:05",
        [("app", 8080), ("sidecar", 9090)],
    );
    if let Some(status) = pod.status.as_mut() {
        status.container_statuses.as_mut().unwrap()[1].ready = false;
    }
    fx.pods.insert(pod);

    let reports = reports(fx.reconcile("web-0").await);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].container, "app");
}

#[tokio::test]
async fn skips_pods_without_intent() {
    let fx = Fixture::default();

    let mut pod = web_pod(None);
    pod.annotations_mut().remove(k8s::REGISTER_ANNOTATION);
    fx.pods.insert(pod);
    assert!(matches!(
        fx.reconcile("web-0").await,
        PassOutcome::Skipped(SkipReason::NotRequested)
    ));

    let mut pod = web_pod(None);
    pod.annotations_mut()
        .insert(k8s::REGISTER_ANNOTATION.to_string(), "False".to_string());
    fx.pods.insert(pod);
    assert!(matches!(
        fx.reconcile("web-0").await,
        PassOutcome::Skipped(SkipReason::NotRequested)
    ));

    assert!(fx.registry.upserts.lock().is_empty());
}

#[tokio::test]
async fn malformed_intent_fails_the_pass() {
    let fx = Fixture::default();
    let mut pod = web_pod(None);
    pod.annotations_mut()
        .insert(k8s::REGISTER_ANNOTATION.to_string(), "yes".to_string());
    fx.pods.insert(pod);

    let outcome = fx.reconcile("web-0").await;
    assert!(
        matches!(
            &outcome,
            PassOutcome::Failed(PassError::InvalidAnnotation(InvalidAnnotation { value, .. })) if value == "yes"
        ),
        "{outcome:?}"
    );
    assert!(fx.registry.upserts.lock().is_empty());
}

#[tokio::test]
async fn skips_pods_that_are_not_serving() {
    let fx = Fixture::default();

    let mut pod = web_pod(None);
    if let Some(status) = pod.status.as_mut() {
        status.phase = Some("Pending".to_string());
    }
    fx.pods.insert(pod);
    assert!(matches!(
        fx.reconcile("web-0").await,
        PassOutcome::Skipped(SkipReason::NotRunning)
    ));

    let mut pod = web_pod(None);
    if let Some(status) = pod.status.as_mut() {
        status.container_statuses = Some(vec![k8s::ContainerStatus {
            name: "app".to_string(),
            ready: false,
            ..Default::default()
        }]);
    }
    fx.pods.insert(pod);
    assert!(matches!(
        fx.reconcile("web-0").await,
        PassOutcome::Skipped(SkipReason::NoReadyContainers)
    ));

    assert!(fx.registry.upserts.lock().is_empty());
    assert!(fx.applied().is_empty());
}

#[tokio::test]
async fn missing_pod_is_gone() {
    let fx = Fixture::default();
    assert!(matches!(fx.reconcile("web-0").await, PassOutcome::Gone));
}

#[tokio::test(start_paused = true)]
async fn pod_fetch_times_out() {
    let reconciler = Reconciler::new(
        Arc::new(Hanging),
        Arc::new(Registry::default()),
        Arc::new(Switch::default()),
        MeshSettings {
            virtual_ip: "10.1.1.254".parse().unwrap(),
            default_network_name: None,
        },
    )
    .with_call_timeout(Duration::from_secs(1));

    let outcome = reconciler.reconcile("default", "web-0").await;
    assert!(
        matches!(
            outcome,
            PassOutcome::Failed(PassError::Timeout(Timeout(d))) if d == Duration::from_secs(1)
        ),
        "{outcome:?}"
    );
}
