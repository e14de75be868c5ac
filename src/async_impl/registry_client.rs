//! Cache first access to a schema registry.
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::cache::CacheSchemaRegistry;
use crate::error::SRCError;

/// The remote side of a schema registry. Implemented by [`SrSettings`] for the REST api, and by
/// [`InMemoryRegistry`] for use without a running registry.
///
/// [`SrSettings`]: crate::async_impl::schema_registry::SrSettings
/// [`InMemoryRegistry`]: crate::async_impl::mock_registry::InMemoryRegistry
pub trait RegistryTransport: Send + Sync {
    /// Registers the schema under the subject, returning the id the registry assigned to it.
    fn register<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> BoxFuture<'a, Result<u32, SRCError>>;

    /// Gets the schema registered with the id.
    fn fetch_by_id(&self, id: u32) -> BoxFuture<'_, Result<String, SRCError>>;
}

/// Wraps a [`RegistryTransport`] with a [`CacheSchemaRegistry`]. Once an id or schema is known the
/// transport is never called again for it, concurrent first calls for the same key share one
/// remote call. Errors of the transport are returned as is and not cached.
///
/// Clones share both the transport and the cache.
#[derive(Clone)]
pub struct SchemaRegistryClient {
    transport: Arc<dyn RegistryTransport>,
    cache: Arc<CacheSchemaRegistry>,
}

impl SchemaRegistryClient {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        cache: Arc<CacheSchemaRegistry>,
    ) -> SchemaRegistryClient {
        SchemaRegistryClient { transport, cache }
    }

    /// Uses a new empty cache.
    pub fn with_transport(transport: Arc<dyn RegistryTransport>) -> SchemaRegistryClient {
        SchemaRegistryClient::new(transport, Arc::new(CacheSchemaRegistry::new()))
    }

    pub async fn register(&self, subject: &str, schema: &str) -> Result<u32, SRCError> {
        self.cache
            .get_or_register_id(subject, schema, || async {
                debug!(subject = %subject, "registering schema");
                let id = self.transport.register(subject, schema).await?;
                debug!(subject = %subject, schema_id = id, "registered schema");
                Ok(id)
            })
            .await
    }

    pub async fn fetch_by_id(&self, id: u32) -> Result<String, SRCError> {
        self.cache
            .get_or_fetch_schema(id, || async {
                debug!(schema_id = id, "fetching schema");
                self.transport.fetch_by_id(id).await
            })
            .await
    }

    pub fn cache(&self) -> &Arc<CacheSchemaRegistry> {
        &self.cache
    }
}
