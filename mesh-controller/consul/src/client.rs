use crate::wire::{HealthEntry, Registration};
use ovs_mesh_controller_core::{CatalogEntry, RegistryError, ServiceDescriptor, ServiceRegistry};
use reqwest::{Response, Url};
use tracing::{debug, instrument};

/// The header that carries a Consul ACL token.
pub const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("consul address {0} is not an HTTP URL")]
    InvalidAddress(Url),

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Talks to a Consul agent.
///
/// Requests are not retried; failures surface to the caller, which is expected to try again on
/// a later reconciliation.
#[derive(Clone, Debug)]
pub struct ConsulRegistry {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

// === impl ConsulRegistry ===

impl ConsulRegistry {
    pub fn new(base: Url, token: Option<String>) -> Result<Self, ClientError> {
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::InvalidAddress(base));
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Joins `segments` onto the agent's base URL, percent-encoding each one.
    fn endpoint<'s>(&self, segments: impl IntoIterator<Item = &'s str>) -> Url {
        let mut url = self.base.clone();
        // `new` rejects URLs that can't carry a path.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    async fn check(rsp: Response) -> Result<Response, RegistryError> {
        let status = rsp.status();
        if status.is_success() {
            return Ok(rsp);
        }
        let message = rsp.text().await.unwrap_or_default();
        Err(RegistryError::Rejected {
            status: status.as_u16(),
            message: message.trim().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ServiceRegistry for ConsulRegistry {
    #[instrument(skip_all, fields(id = %service.id, name = %service.name))]
    async fn upsert(&self, service: &ServiceDescriptor) -> Result<(), RegistryError> {
        let url = self.endpoint(["v1", "agent", "service", "register"]);
        let rsp = self
            .request(reqwest::Method::PUT, url)
            .json(&Registration::from(service))
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.into()))?;
        Self::check(rsp).await?;
        debug!("Registered service");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resolve(&self, service_name: &str) -> Result<Vec<CatalogEntry>, RegistryError> {
        let mut url = self.endpoint(["v1", "health", "service", service_name]);
        url.query_pairs_mut().append_pair("passing", "true");

        let rsp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.into()))?;
        let body = Self::check(rsp)
            .await?
            .bytes()
            .await
            .map_err(|e| RegistryError::Unavailable(e.into()))?;
        let resolved = decode_health(service_name, &body)?;
        debug!(resolved = resolved.len(), "Resolved service");
        Ok(resolved)
    }
}

/// Decodes a health response into the catalog entries of `service_name`.
///
/// Consul answers `null` for services it has never seen. Entries for other services and instances
/// without an IP address are dropped.
fn decode_health(service_name: &str, body: &[u8]) -> Result<Vec<CatalogEntry>, RegistryError> {
    let entries = serde_json::from_slice::<Option<Vec<HealthEntry>>>(body)
        .map_err(|e| RegistryError::Malformed(e.into()))?
        .unwrap_or_default();

    let total = entries.len();
    let resolved = entries
        .into_iter()
        .filter(|e| e.service.service == service_name)
        .filter_map(|e| {
            let id = e.service.id.clone();
            let entry = e.into_catalog_entry();
            if entry.is_none() {
                debug!(%id, "Ignoring instance without an IP address");
            }
            entry
        })
        .collect::<Vec<_>>();
    if resolved.len() < total {
        debug!(total, resolved = resolved.len(), "Dropped instances");
    }
    Ok(resolved)
}
