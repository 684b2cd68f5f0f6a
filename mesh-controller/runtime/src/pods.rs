use crate::k8s::{self, Api};

/// Looks up pods by name.
#[async_trait::async_trait]
pub trait PodSource: Send + Sync {
    /// Returns `None` if the pod doesn't exist.
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<Option<k8s::Pod>>;
}

/// Reads pods from the Kubernetes API.
#[derive(Clone)]
pub struct ClusterPods(k8s::Client);

// === impl ClusterPods ===

impl ClusterPods {
    pub fn new(client: k8s::Client) -> Self {
        Self(client)
    }
}

#[async_trait::async_trait]
impl PodSource for ClusterPods {
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<Option<k8s::Pod>> {
        let pod = Api::<k8s::Pod>::namespaced(self.0.clone(), namespace)
            .get_opt(name)
            .await?;
        Ok(pod)
    }
}
