//! Recency/frequency scoring shared by every cache backend.
//!
//! Each touch of an entry adds `cost * base` to its score, then grows
//! `base` by `1 + 1/halflife`. Older touches therefore weigh exponentially
//! less than recent ones: after `halflife` further touches anywhere in the
//! cache, a past touch counts roughly half as much as a fresh one. Entries
//! that are expensive to recompute and frequently read score highest.
//!
//! `base` grows without bound, so once it crosses [`RESCALE_THRESHOLD`] the
//! owner divides every stored score by `base` and resets it to 1. Relative
//! order is preserved.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `base` value that triggers renormalisation of all scores.
pub const RESCALE_THRESHOLD: f64 = 1e100;

/// Score accumulator state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scorer {
    base: f64,
    growth: f64,
    /// Monotonic insertion counter, used to break score ties.
    next_order: u64,
}

impl Scorer {
    pub fn new(halflife: f64) -> Self {
        Self {
            base: 1.0,
            growth: 1.0 + 1.0 / halflife,
            next_order: 0,
        }
    }

    /// Score after one more touch of an entry currently scored `previous`.
    ///
    /// Zero-cost entries still gain recency.
    pub fn touch(&mut self, previous: f64, cost: u64) -> f64 {
        let score = previous + cost.max(1) as f64 * self.base;
        self.base *= self.growth;
        score
    }

    /// Allocate the insertion order for a new entry.
    pub fn next_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    pub fn needs_rescale(&self) -> bool {
        self.base > RESCALE_THRESHOLD
    }

    /// Reset `base` to 1 and return the factor every stored score must be
    /// divided by.
    pub fn rescale(&mut self) -> f64 {
        let factor = self.base;
        self.base = 1.0;
        factor
    }

    pub fn base(&self) -> f64 {
        self.base
    }
}

/// Position of an entry in eviction order.
///
/// Lower scores are evicted first; on equal scores the older insertion goes
/// first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Rank {
    pub score: f64,
    pub order: u64,
}

impl Rank {
    pub fn new(score: f64, order: u64) -> Self {
        Self { score, order }
    }
}

impl PartialEq for Rank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Rank {}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.order.cmp(&other.order))
    }
}

/// Entries ordered for eviction.
///
/// Insertion orders are unique, so every rank maps to exactly one key.
#[derive(Debug, Clone)]
pub struct Ranking<K> {
    by_rank: BTreeMap<Rank, K>,
}

impl<K> Default for Ranking<K> {
    fn default() -> Self {
        Self {
            by_rank: BTreeMap::new(),
        }
    }
}

impl<K> Ranking<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rank: Rank, key: K) {
        self.by_rank.insert(rank, key);
    }

    pub fn remove(&mut self, rank: &Rank) -> Option<K> {
        self.by_rank.remove(rank)
    }

    /// Remove and return the next victim.
    pub fn pop_lowest(&mut self) -> Option<(Rank, K)> {
        self.by_rank.pop_first()
    }

    pub fn len(&self) -> usize {
        self.by_rank.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rank.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_rank.clear();
    }

    /// Divide every score by `factor`, keeping relative order.
    pub fn rescale(&mut self, factor: f64) {
        let entries = std::mem::take(&mut self.by_rank);
        self.by_rank = entries
            .into_iter()
            .map(|(rank, key)| (Rank::new(rank.score / factor, rank.order), key))
            .collect();
    }
}

impl<K> FromIterator<(Rank, K)> for Ranking<K> {
    fn from_iter<I: IntoIterator<Item = (Rank, K)>>(iter: I) -> Self {
        Self {
            by_rank: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_touch_outweighs_old_touch() {
        let mut scorer = Scorer::new(10.0);
        let old = scorer.touch(0.0, 100);
        for _ in 0..50 {
            scorer.touch(0.0, 1);
        }
        let recent = scorer.touch(0.0, 100);
        assert!(recent > old);
    }

    #[test]
    fn test_frequency_accumulates() {
        let mut scorer = Scorer::new(1000.0);
        let once = scorer.touch(0.0, 10);
        let twice = scorer.touch(once, 10);
        assert!(twice > once);
    }

    #[test]
    fn test_zero_cost_still_scores() {
        let mut scorer = Scorer::new(1000.0);
        assert!(scorer.touch(0.0, 0) > 0.0);
    }

    #[test]
    fn test_rescale_resets_base() {
        let mut scorer = Scorer::new(1e-3);
        let mut score = 0.0;
        while !scorer.needs_rescale() {
            score = scorer.touch(score, 1);
        }
        let factor = scorer.rescale();
        assert!(factor > RESCALE_THRESHOLD);
        assert_eq!(scorer.base(), 1.0);
        assert!((score / factor).is_finite());
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let mut ranking = Ranking::new();
        ranking.insert(Rank::new(5.0, 2), "c");
        ranking.insert(Rank::new(5.0, 0), "a");
        ranking.insert(Rank::new(5.0, 1), "b");
        ranking.insert(Rank::new(1.0, 3), "d");

        let order: Vec<_> = std::iter::from_fn(|| ranking.pop_lowest().map(|(_, k)| k)).collect();
        assert_eq!(order, vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_ranking_rescale_keeps_order() {
        let mut ranking: Ranking<&str> = [
            (Rank::new(300.0, 0), "high"),
            (Rank::new(100.0, 1), "low"),
        ]
        .into_iter()
        .collect();
        ranking.rescale(100.0);
        let (rank, key) = ranking.pop_lowest().expect("entry");
        assert_eq!(key, "low");
        assert!((rank.score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_insertion_order_is_monotonic() {
        let mut scorer = Scorer::new(1.0);
        let a = scorer.next_order();
        let b = scorer.next_order();
        assert!(b > a);
    }
}
