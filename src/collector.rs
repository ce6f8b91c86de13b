//! Bounded priority collector for the substructure verification stage.
//!
//! Keeps the best `capacity` hits seen so far: higher score first, ties
//! broken toward the lower document id. That tie-break is the reverse of
//! the usual lexical heap, so this wraps the standard heap with an
//! inverted comparator instead of reimplementing it.
//!
//! ```
//! use moldex::collector::SubstructureCollector;
//! use moldex::store::{DocKey, ScoredHit};
//!
//! let mut collector = SubstructureCollector::new(2);
//! for (doc, score) in [(7, 0.5), (3, 0.9), (9, 0.9), (1, 0.1)] {
//!     collector.collect(ScoredHit {
//!         doc: DocKey { segment: 0, doc },
//!         score,
//!     });
//! }
//! let hits = collector.into_sorted_hits();
//! assert_eq!(hits.len(), 2);
//! assert_eq!(hits[0].doc.doc, 3); // best score, lower doc id wins the tie
//! assert_eq!(hits[1].doc.doc, 9);
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::store::{DocKey, Hits, ScoredHit};

/// Heap entry ordered so the *worst* hit is the heap maximum: lowest score
/// first, then the higher document id.
struct WorstFirst(ScoredHit);

impl PartialEq for WorstFirst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WorstFirst {}

impl PartialOrd for WorstFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorstFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .score
            .total_cmp(&self.0.score)
            .then_with(|| self.0.doc.cmp(&other.0.doc))
    }
}

pub struct SubstructureCollector {
    heap: BinaryHeap<WorstFirst>,
    capacity: usize,
}

impl SubstructureCollector {
    pub fn new(capacity: usize) -> Self {
        SubstructureCollector {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
        }
    }

    /// Pre-populated with sentinel entries so `len()` reports the capacity
    /// from the start. Sentinels lose every comparison; callers using this
    /// constructor must track their real insertion count themselves.
    pub fn prefilled(capacity: usize) -> Self {
        let mut collector = Self::new(capacity);
        for _ in 0..capacity {
            collector.heap.push(WorstFirst(ScoredHit {
                doc: DocKey::SENTINEL,
                score: f32::NEG_INFINITY,
            }));
        }
        collector
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offer one hit: kept while below capacity, otherwise it replaces the
    /// current worst entry if it beats it. Returns whether the hit was
    /// kept.
    pub fn collect(&mut self, hit: ScoredHit) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(WorstFirst(hit));
            return true;
        }
        let Some(worst) = self.heap.peek() else {
            return false;
        };
        if WorstFirst(hit) < *worst {
            // Strictly better than the worst retained entry.
            self.heap.pop();
            self.heap.push(WorstFirst(hit));
            true
        } else {
            false
        }
    }

    /// Extract hits best-first by repeatedly popping the worst and
    /// reversing.
    pub fn into_sorted_hits(self) -> Vec<ScoredHit> {
        let mut out: Vec<ScoredHit> = self
            .heap
            .into_sorted_vec()
            .into_iter()
            .map(|entry| entry.0)
            .collect();
        // `into_sorted_vec` is ascending by our inverted comparator, i.e.
        // best-first already; keep sentinels (if any) at the tail.
        out.retain(|hit| hit.doc != DocKey::SENTINEL);
        out
    }

    pub fn into_hits(self) -> Hits {
        Hits {
            entries: self.into_sorted_hits(),
        }
    }
}
