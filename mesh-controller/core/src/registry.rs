use crate::{CatalogEntry, ServiceDescriptor};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry couldn't be reached. Callers should wait for the next reconciliation rather
    /// than retrying.
    #[error("registry unavailable: {0}")]
    Unavailable(#[source] BoxError),

    #[error("registry rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed registry response: {0}")]
    Malformed(#[source] BoxError),
}

/// A service registry that holds mesh registrations.
#[async_trait::async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Registers `service`, replacing any prior registration with the same id.
    async fn upsert(&self, service: &ServiceDescriptor) -> Result<(), RegistryError>;

    /// Lists the healthy instances of `service_name` in the registry's order.
    ///
    /// A known service without healthy instances resolves to an empty list, not an error.
    async fn resolve(&self, service_name: &str) -> Result<Vec<CatalogEntry>, RegistryError>;
}
