use std::cmp::Ordering;

use ordered_float::OrderedFloat;

/// An element held by a [`Beam`] together with its score.
///
/// `seq` is the insertion sequence number; it breaks score ties so that the
/// element inserted first ranks higher.
#[derive(Debug, Clone)]
pub struct ScoredEntry<T> {
    pub elt: T,
    pub score: OrderedFloat<f64>,
    seq: u64,
}

impl<T> ScoredEntry<T> {
    /// Ranking key: higher score first, then earlier insertion first.
    fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Bounded container holding the K highest-scoring elements added so far.
///
/// Inserting more than K elements evicts the lowest scorer. Entries are kept
/// in rank order (descending score, ties by insertion order), so reading the
/// beam never sorts.
#[derive(Debug, Clone)]
pub struct Beam<T> {
    capacity: usize,
    entries: Vec<ScoredEntry<T>>,
    next_seq: u64,
}

impl<T> Beam<T> {
    /// Create an empty beam of capacity `capacity` (must be >= 1).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "beam capacity must be >= 1");
        Self {
            capacity,
            entries: Vec::with_capacity(capacity + 1),
            next_seq: 0,
        }
    }

    /// Insert `elt` with `score`. Returns false if it was rejected outright
    /// because the beam is full of strictly better (or equal, earlier) entries.
    pub fn add(&mut self, elt: T, score: f64) -> bool {
        let entry = ScoredEntry {
            elt,
            score: OrderedFloat(score),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        // First position whose entry ranks below the new one.
        let pos = self
            .entries
            .partition_point(|e| e.rank_cmp(&entry) == Ordering::Less);
        if pos >= self.capacity {
            return false;
        }
        self.entries.insert(pos, entry);
        self.entries.truncate(self.capacity);
        true
    }

    /// Current elements and scores, best first.
    pub fn elts_and_scores(&self) -> Vec<(&T, f64)> {
        self.entries.iter().map(|e| (&e.elt, e.score.0)).collect()
    }

    /// Consume the beam, returning elements and scores best first.
    pub fn into_elts_and_scores(self) -> Vec<(T, f64)> {
        self.entries.into_iter().map(|e| (e.elt, e.score.0)).collect()
    }

    /// Iterate over entries best first.
    pub fn iter(&self) -> impl Iterator<Item = &ScoredEntry<T>> {
        self.entries.iter()
    }

    /// Score of the best entry, if any.
    pub fn head_score(&self) -> Option<f64> {
        self.entries.first().map(|e| e.score.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
