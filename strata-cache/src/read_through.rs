//! Read-through lookups over a [`Cache`] and an origin [`Transport`].
//!
//! Cache failures never fail a lookup: they are logged and the request
//! falls through to the origin. Cache operations run on the blocking pool
//! since the on-disk backend does file and index I/O.

use std::sync::Arc;

use async_trait::async_trait;
use strata_core::CacheKey;
use thiserror::Error;
use tracing::{debug, warn};

use crate::freshness::{CacheRead, Freshness};
use crate::traits::{Cache, CachedResource, PutOutcome, ResourceMetadata};

/// Origin request failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Resource {path} not found at origin")]
    NotFound { path: String },

    #[error("Origin request for {path} failed: {reason}")]
    Failed { path: String, reason: String },
}

/// A full response from the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub media_type: Option<String>,
}

impl Fetched {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            etag: None,
            media_type: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// Answer to a conditional request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revalidation {
    /// The cached representation is still current.
    Unchanged,
    Modified(Fetched),
}

/// The origin serving representations addressed by [`CacheKey`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Unconditional fetch.
    async fn fetch(&self, key: &CacheKey) -> Result<Fetched, TransportError>;

    /// Conditional fetch against a previously returned entity tag.
    async fn revalidate(&self, key: &CacheKey, etag: &str) -> Result<Revalidation, TransportError>;
}

/// Cache in front of a [`Transport`], honouring a [`Freshness`] contract
/// per lookup.
pub struct ReadThroughCache<T: Transport> {
    cache: Option<Arc<dyn Cache>>,
    transport: Arc<T>,
}

impl<T: Transport> ReadThroughCache<T> {
    pub fn new(cache: Arc<dyn Cache>, transport: Arc<T>) -> Self {
        Self {
            cache: Some(cache),
            transport,
        }
    }

    /// Pass every lookup straight to the origin.
    pub fn uncached(transport: Arc<T>) -> Self {
        Self {
            cache: None,
            transport,
        }
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Look up `key`, consulting the origin as `freshness` requires.
    ///
    /// Cached entries carrying an entity tag are revalidated with a
    /// conditional request; entries without one are refetched.
    pub async fn get(
        &self,
        key: &CacheKey,
        freshness: Freshness,
    ) -> Result<CacheRead<CachedResource>, TransportError> {
        if let Some(cached) = self.lookup(key).await {
            if freshness.accepts(cached.metadata.cached_at) {
                debug!(key = %key, "Serving cached representation");
                let cached_at = cached.metadata.cached_at;
                return Ok(CacheRead::from_cache(cached, cached_at));
            }

            if let Some(etag) = cached.metadata.etag.clone() {
                match self.transport.revalidate(key, &etag).await {
                    Ok(Revalidation::Unchanged) => {
                        debug!(key = %key, etag = %etag, "Origin confirmed cached representation");
                        let refreshed = CachedResource {
                            body: cached.body.clone(),
                            metadata: cached.metadata.refreshed(),
                        };
                        self.store(key, refreshed.clone()).await;
                        return Ok(CacheRead::revalidated(refreshed));
                    }
                    Ok(Revalidation::Modified(fetched)) => {
                        return Ok(self.admit(key, fetched).await);
                    }
                    Err(e @ TransportError::NotFound { .. }) => {
                        self.invalidate(key).await;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match self.transport.fetch(key).await {
            Ok(fetched) => Ok(self.admit(key, fetched).await),
            Err(e) => {
                if matches!(e, TransportError::NotFound { .. }) {
                    self.invalidate(key).await;
                }
                Err(e)
            }
        }
    }

    /// Drop any cached representation of `key`.
    pub async fn invalidate(&self, key: &CacheKey) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let owned = key.clone();
        match tokio::task::spawn_blocking(move || cache.discard(&owned)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %key, error = %e, "Failed to discard cache entry"),
            Err(e) => warn!(key = %key, error = %e, "Cache discard task failed"),
        }
    }

    async fn admit(&self, key: &CacheKey, fetched: Fetched) -> CacheRead<CachedResource> {
        let resource = CachedResource::new(
            fetched.body,
            ResourceMetadata::new(fetched.etag, fetched.media_type),
        );
        self.store(key, resource.clone()).await;
        CacheRead::from_origin(resource)
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CachedResource> {
        let cache = self.cache.clone()?;
        let owned = key.clone();
        match tokio::task::spawn_blocking(move || cache.get(&owned)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup task failed, treating as miss");
                None
            }
        }
    }

    /// Cache `resource`. If it cannot be stored, any older representation
    /// under `key` is discarded so it is not served again.
    async fn store(&self, key: &CacheKey, resource: CachedResource) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let owned = key.clone();
        let cost = resource.len() as u64;
        match tokio::task::spawn_blocking(move || cache.put(&owned, resource, cost)).await {
            Ok(Ok(PutOutcome::Stored { evicted })) => {
                debug!(key = %key, cost, evicted = evicted.len(), "Cached representation");
                return;
            }
            Ok(Ok(outcome)) => debug!(key = %key, cost, ?outcome, "Representation not cached"),
            Ok(Err(e)) => warn!(key = %key, error = %e, "Failed to cache representation"),
            Err(e) => warn!(key = %key, error = %e, "Cache store task failed"),
        }
        self.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetched_builder() {
        let fetched = Fetched::new(b"abc".to_vec())
            .with_etag("\"1\"")
            .with_media_type("text/plain");
        assert_eq!(fetched.etag.as_deref(), Some("\"1\""));
        assert_eq!(fetched.media_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Failed {
            path: "x".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(err.to_string().contains("timeout"));
    }
}
