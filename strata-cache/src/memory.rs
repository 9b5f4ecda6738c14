//! In-memory scored eviction cache.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use strata_core::{CacheConfig, CacheError, CacheKey, CacheResult, ConfigError};
use tracing::{debug, warn};

use crate::scorer::{Rank, Ranking, Scorer};
use crate::traits::{Cache, CacheStats, CachedResource, PutOutcome};

struct Entry {
    resource: CachedResource,
    cost: u64,
    rank: Rank,
}

struct State {
    entries: HashMap<CacheKey, Entry>,
    ranking: Ranking<CacheKey>,
    scorer: Scorer,
    used: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl State {
    fn new(halflife: f64) -> Self {
        Self {
            entries: HashMap::new(),
            ranking: Ranking::new(),
            scorer: Scorer::new(halflife),
            used: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn maybe_rescale(&mut self) {
        if !self.scorer.needs_rescale() {
            return;
        }
        let factor = self.scorer.rescale();
        for entry in self.entries.values_mut() {
            entry.rank.score /= factor;
        }
        self.ranking.rescale(factor);
    }
}

/// Process-local cache bounded by a byte budget.
///
/// All operations run under a single lock, so `clear` is atomic with respect
/// to concurrent readers and writers.
pub struct InMemoryCache {
    capacity: u64,
    error_if_full: bool,
    state: Mutex<State>,
}

impl InMemoryCache {
    /// Build from configuration. `available_bytes` is required.
    pub fn new(config: &CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let capacity = config
            .available_bytes
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "available_bytes".to_string(),
            })?;
        Ok(Self {
            capacity,
            error_if_full: config.error_if_full,
            state: Mutex::new(State::new(config.halflife)),
        })
    }

    /// Cache with the given budget and default scoring.
    pub fn with_capacity(available_bytes: u64) -> Self {
        Self {
            capacity: available_bytes,
            error_if_full: false,
            state: Mutex::new(State::new(strata_core::DEFAULT_HALFLIFE)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedResource>> {
        let mut state = self.lock();
        let state = &mut *state;
        let Some(entry) = state.entries.get_mut(key) else {
            state.misses += 1;
            return Ok(None);
        };

        state.ranking.remove(&entry.rank);
        let score = state.scorer.touch(entry.rank.score, entry.cost);
        entry.rank.score = score;
        state.ranking.insert(entry.rank, key.clone());
        let resource = entry.resource.clone();
        state.hits += 1;
        state.maybe_rescale();
        Ok(Some(resource))
    }

    fn put(&self, key: &CacheKey, resource: CachedResource, cost: u64) -> CacheResult<PutOutcome> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let existing_cost = state.entries.get(key).map_or(0, |e| e.cost);
        let used_without = state.used - existing_cost;

        if cost > self.capacity {
            if self.error_if_full {
                return Err(CacheError::Full {
                    key: key.to_string(),
                    required: cost,
                    free: self.capacity - used_without,
                    capacity: self.capacity,
                });
            }
            warn!(key = %key, cost, capacity = self.capacity, "Entry larger than cache budget, not cached");
            // The cached representation is outdated by this one.
            if let Some(old) = state.entries.remove(key) {
                state.ranking.remove(&old.rank);
                state.used -= old.cost;
            }
            return Ok(PutOutcome::TooLarge);
        }

        if used_without + cost > self.capacity && self.error_if_full {
            return Err(CacheError::Full {
                key: key.to_string(),
                required: cost,
                free: self.capacity - used_without,
                capacity: self.capacity,
            });
        }

        // Replacing an entry keeps its score history and insertion order.
        let previous = state.entries.remove(key).map(|old| {
            state.ranking.remove(&old.rank);
            state.used -= old.cost;
            old.rank
        });

        let mut evicted = Vec::new();
        while state.used + cost > self.capacity {
            let Some((_, victim)) = state.ranking.pop_lowest() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&victim) {
                state.used -= entry.cost;
                state.evictions += 1;
                debug!(key = %victim, cost = entry.cost, score = entry.rank.score, "Evicted cache entry");
            }
            evicted.push(victim);
        }

        let (prior_score, order) = match previous {
            Some(rank) => (rank.score, rank.order),
            None => (0.0, state.scorer.next_order()),
        };
        let rank = Rank::new(state.scorer.touch(prior_score, cost), order);
        state.ranking.insert(rank, key.clone());
        state.entries.insert(
            key.clone(),
            Entry {
                resource,
                cost,
                rank,
            },
        );
        state.used += cost;
        state.maybe_rescale();

        Ok(PutOutcome::Stored { evicted })
    }

    fn discard(&self, key: &CacheKey) -> CacheResult<()> {
        let mut state = self.lock();
        if let Some(entry) = state.entries.remove(key) {
            state.ranking.remove(&entry.rank);
            state.used -= entry.cost;
        }
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        let mut state = self.lock();
        state.entries.clear();
        state.ranking.clear();
        state.used = 0;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            entry_count: state.entries.len() as u64,
            bytes_used: state.used,
            evictions: state.evictions,
        }
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}
