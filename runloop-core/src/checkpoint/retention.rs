//! Bounded best-K retention.
//!
//! Scores are always "larger is better"; callers negate metrics that should be
//! minimized before offering them.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Direction in which a metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricMode {
    Min,
    Max,
}

impl MetricMode {
    /// Map a raw metric onto the larger-is-better score scale.
    pub fn score(self, metric: f64) -> f64 {
        match self {
            MetricMode::Min => -metric,
            MetricMode::Max => metric,
        }
    }
}

/// One retained checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub score: f64,
    pub path: PathBuf,
}

impl PartialEq for CheckpointRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CheckpointRecord {}

impl PartialOrd for CheckpointRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CheckpointRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.path.cmp(&other.path))
    }
}

/// What the caller must do on disk after an [`BestK::offer`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionDecision {
    /// Persist the offered checkpoint.
    pub persist: bool,
    /// Delete this previously retained checkpoint.
    pub evicted: Option<CheckpointRecord>,
    /// The offered score beats every score seen so far.
    pub new_best: bool,
}

/// Serializable snapshot of a [`BestK`], carried in checkpoint metadata so a
/// resumed run keeps ranking against the epochs before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<f64>,
    /// Best first.
    #[serde(default)]
    pub records: Vec<CheckpointRecord>,
}

/// Fixed-capacity min-heap of the best `capacity` checkpoints.
#[derive(Debug, Clone)]
pub struct BestK {
    capacity: usize,
    retained: BinaryHeap<Reverse<CheckpointRecord>>,
    best: Option<f64>,
}

impl BestK {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            retained: BinaryHeap::with_capacity(capacity + 1),
            best: None,
        }
    }

    /// Offer a checkpoint scored `score`, to be stored at `path`.
    ///
    /// While below capacity every offer is persisted. At capacity the current
    /// minimum is evicted only if `score` is strictly greater, so a tie with the
    /// minimum is dropped. A tie with the best never moves it.
    pub fn offer(&mut self, score: f64, path: PathBuf) -> RetentionDecision {
        let mut decision = RetentionDecision::default();

        if self.retained.len() < self.capacity {
            decision.persist = true;
        } else if self
            .retained
            .peek()
            .is_some_and(|Reverse(min)| score > min.score)
        {
            decision.evicted = self.retained.pop().map(|Reverse(record)| record);
            decision.persist = true;
        }

        if decision.persist {
            self.retained.push(Reverse(CheckpointRecord { score, path }));
        }

        if self.best.is_none_or(|best| score > best) {
            self.best = Some(score);
            decision.new_best = true;
        }

        decision
    }

    /// Retained records, best first.
    pub fn retained(&self) -> Vec<&CheckpointRecord> {
        let mut records: Vec<_> = self.retained.iter().map(|Reverse(r)| r).collect();
        records.sort_by(|a, b| b.cmp(a));
        records
    }

    pub fn min(&self) -> Option<&CheckpointRecord> {
        self.retained.peek().map(|Reverse(r)| r)
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> RetentionState {
        RetentionState {
            best: self.best,
            records: self.retained().into_iter().cloned().collect(),
        }
    }

    /// Rebuild from a snapshot, possibly taken under another capacity.
    ///
    /// Returns the records that no longer fit; the caller owns their files.
    /// The best score never drops below the best retained record.
    pub fn restore(capacity: usize, state: RetentionState) -> (Self, Vec<CheckpointRecord>) {
        let mut best_k = Self::new(capacity);
        let mut records = state.records;
        records.sort_by(|a, b| b.cmp(a));
        let overflow = records.split_off(records.len().min(best_k.capacity));

        let top = records.first().map(|r| r.score);
        best_k.best = match (state.best, top) {
            (Some(best), Some(top)) => Some(best.max(top)),
            (best, top) => best.or(top),
        };
        best_k.retained.extend(records.into_iter().map(Reverse));
        (best_k, overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(epoch: usize) -> PathBuf {
        PathBuf::from(format!("epoch_{epoch}.json"))
    }

    fn scores(best_k: &BestK) -> Vec<f64> {
        best_k.retained().iter().map(|r| r.score).collect()
    }

    #[test]
    fn test_fills_to_capacity() {
        let mut best_k = BestK::new(3);
        for (i, s) in [0.3, 0.1, 0.2].into_iter().enumerate() {
            assert!(best_k.offer(s, path(i + 1)).persist);
        }
        assert_eq!(best_k.len(), 3);
        assert_eq!(scores(&best_k), vec![0.3, 0.2, 0.1]);
        assert_eq!(best_k.min().unwrap().score, 0.1);
    }

    #[test]
    fn test_evicts_minimum_on_strict_improvement() {
        let mut best_k = BestK::new(2);
        best_k.offer(0.1, path(1));
        best_k.offer(0.5, path(2));

        let decision = best_k.offer(0.3, path(3));
        assert!(decision.persist);
        assert_eq!(decision.evicted.unwrap().path, path(1));
        assert!(!decision.new_best);
        assert_eq!(scores(&best_k), vec![0.5, 0.3]);
    }

    #[test]
    fn test_tie_with_minimum_is_ignored() {
        let mut best_k = BestK::new(1);
        best_k.offer(0.4, path(1));

        let decision = best_k.offer(0.4, path(2));
        assert_eq!(decision, RetentionDecision::default());
        assert_eq!(best_k.retained()[0].path, path(1));
    }

    #[test]
    fn test_min_mode_scenario() {
        let mut best_k = BestK::new(1);
        let mode = MetricMode::Min;

        let d1 = best_k.offer(mode.score(2.0), path(1));
        assert!(d1.persist && d1.new_best);

        let d2 = best_k.offer(mode.score(1.0), path(2));
        assert!(d2.persist && d2.new_best);
        assert_eq!(d2.evicted.unwrap().path, path(1));

        let d3 = best_k.offer(mode.score(1.5), path(3));
        assert_eq!(d3, RetentionDecision::default());

        assert_eq!(best_k.retained()[0].path, path(2));
        assert_eq!(best_k.best_score(), Some(-1.0));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let best_k = BestK::new(0);
        assert_eq!(best_k.capacity(), 1);
        assert!(best_k.is_empty());
    }

    #[test]
    fn test_restore_keeps_ranking_and_best() {
        let mut best_k = BestK::new(2);
        best_k.offer(0.9, path(1));
        best_k.offer(0.4, path(2));
        best_k.offer(0.6, path(3));

        let json = serde_json::to_value(best_k.state()).unwrap();
        let state: RetentionState = serde_json::from_value(json).unwrap();
        let (mut restored, overflow) = BestK::restore(2, state);
        assert!(overflow.is_empty());
        assert_eq!(scores(&restored), vec![0.9, 0.6]);
        assert_eq!(restored.best_score(), Some(0.9));

        let decision = restored.offer(0.1, path(4));
        assert_eq!(decision, RetentionDecision::default());
    }

    #[test]
    fn test_restore_into_smaller_capacity_returns_overflow() {
        let mut best_k = BestK::new(3);
        for (i, s) in [0.2, 0.8, 0.5].into_iter().enumerate() {
            best_k.offer(s, path(i + 1));
        }
        let (restored, overflow) = BestK::restore(1, best_k.state());
        assert_eq!(scores(&restored), vec![0.8]);
        let dropped: Vec<_> = overflow.iter().map(|r| r.path.clone()).collect();
        assert_eq!(dropped, vec![path(3), path(1)]);
    }

    #[test]
    fn test_new_best_at_capacity_is_persisted() {
        let mut best_k = BestK::new(2);
        best_k.offer(0.5, path(1));
        best_k.offer(0.6, path(2));

        let decision = best_k.offer(0.9, path(3));
        assert!(decision.new_best);
        assert!(decision.persist);
        assert_eq!(decision.evicted.unwrap().path, path(1));
    }
}
