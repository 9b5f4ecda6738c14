//! STRATA Cache - Scored Eviction Cache
//!
//! Byte-budgeted caches for fetched resource representations, keyed by
//! [`CacheKey`](strata_core::CacheKey). Entries are ranked by a score that
//! rewards both recency and frequency of access, weighted by cost; when a
//! `put` would exceed the budget the lowest-scoring entries are evicted,
//! oldest first on ties.
//!
//! Two backends implement [`Cache`]:
//!
//! - [`InMemoryCache`]: process-local, single lock.
//! - [`DiskCache`]: persistent and shareable between processes, with an LMDB
//!   index and immutable payload files.
//!
//! [`ReadThroughCache`] puts either in front of an origin [`Transport`] and
//! applies a per-lookup [`Freshness`] contract.
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(DiskCache::open(&CacheConfig::on_disk("/var/cache/strata"))?);
//! let reader = ReadThroughCache::new(cache, Arc::new(origin));
//!
//! let read = reader
//!     .get(&CacheKey::new("raw/scan_1", "application/json"), Freshness::best_effort(Duration::from_secs(60)))
//!     .await?;
//! if read.staleness() > Duration::from_secs(30) {
//!     tracing::warn!("serving an old representation");
//! }
//! ```

pub mod disk;
pub mod freshness;
pub mod memory;
pub mod read_through;
pub mod scorer;
pub mod traits;

pub use disk::DiskCache;
pub use freshness::{CacheRead, Freshness, ReadSource};
pub use memory::InMemoryCache;
pub use read_through::{Fetched, ReadThroughCache, Revalidation, Transport, TransportError};
pub use scorer::{Rank, Ranking, Scorer, RESCALE_THRESHOLD};
pub use traits::{Cache, CacheStats, CachedResource, PutOutcome, ResourceMetadata};

use std::sync::Arc;

use strata_core::{CacheConfig, CacheResult};

/// Open the backend `config` describes: on disk when `path` is set,
/// otherwise in memory.
pub fn open_cache(config: &CacheConfig) -> CacheResult<Arc<dyn Cache>> {
    match config.path {
        Some(_) => Ok(Arc::new(DiskCache::open(config)?)),
        None => Ok(Arc::new(InMemoryCache::new(config)?)),
    }
}
