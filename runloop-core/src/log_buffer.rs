//! Rank-local metric buffer shared between the runner and hooks.

use std::collections::BTreeMap;

/// Accumulates per-iteration values and exposes the current view in `output`.
///
/// `update` overwrites `output` with the latest iteration's values; `average`
/// replaces it with sample-weighted means over the recorded history.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    history: BTreeMap<String, Vec<(f64, usize)>>,
    output: BTreeMap<String, f64>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one iteration's values, weighted by `count` samples.
    pub fn update(&mut self, values: &BTreeMap<String, f64>, count: usize) {
        for (key, value) in values {
            self.history
                .entry(key.clone())
                .or_default()
                .push((*value, count));
            self.output.insert(key.clone(), *value);
        }
    }

    /// Replace `output` with the weighted mean of the last `last_n` updates per
    /// key, or of the whole history when `last_n` is `None`.
    pub fn average(&mut self, last_n: Option<usize>) {
        let means = self.averaged(last_n);
        self.output.extend(means);
    }

    /// Weighted means as [`average`](Self::average) computes them, without
    /// touching `output`.
    pub fn averaged(&self, last_n: Option<usize>) -> BTreeMap<String, f64> {
        self.history
            .iter()
            .filter_map(|(key, entries)| {
                let window = match last_n {
                    Some(n) => &entries[entries.len().saturating_sub(n)..],
                    None => &entries[..],
                };
                weighted_mean(window).map(|mean| (key.clone(), mean))
            })
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.output.get(key).copied()
    }

    /// Set a value in `output` directly, bypassing history.
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.output.insert(key.into(), value);
    }

    pub fn output(&self) -> &BTreeMap<String, f64> {
        &self.output
    }

    /// Number of updates recorded for `key` since the last clear.
    pub fn count(&self, key: &str) -> usize {
        self.history.get(key).map(Vec::len).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.output.clear();
    }
}

fn weighted_mean(entries: &[(f64, usize)]) -> Option<f64> {
    let total: usize = entries.iter().map(|(_, n)| n).sum();
    if total == 0 {
        // Zero-weight updates still carry a value; fall back to a plain mean.
        if entries.is_empty() {
            return None;
        }
        return Some(entries.iter().map(|(v, _)| v).sum::<f64>() / entries.len() as f64);
    }
    let sum: f64 = entries.iter().map(|(v, n)| v * *n as f64).sum();
    Some(sum / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_update_overwrites_output() {
        let mut buf = LogBuffer::new();
        buf.update(&values(&[("loss", 1.0)]), 4);
        buf.update(&values(&[("loss", 3.0)]), 4);
        assert_eq!(buf.get("loss"), Some(3.0));
        assert_eq!(buf.count("loss"), 2);
    }

    #[test]
    fn test_average_is_sample_weighted() {
        let mut buf = LogBuffer::new();
        buf.update(&values(&[("acc", 1.0)]), 3);
        buf.update(&values(&[("acc", 0.0)]), 1);
        buf.average(None);
        assert_eq!(buf.get("acc"), Some(0.75));
    }

    #[test]
    fn test_average_last_n() {
        let mut buf = LogBuffer::new();
        for v in [10.0, 2.0, 4.0] {
            buf.update(&values(&[("loss", v)]), 1);
        }
        buf.average(Some(2));
        assert_eq!(buf.get("loss"), Some(3.0));
    }

    #[test]
    fn test_averaged_leaves_output_alone() {
        let mut buf = LogBuffer::new();
        buf.update(&values(&[("loss", 4.0)]), 1);
        buf.update(&values(&[("loss", 2.0)]), 1);
        assert_eq!(buf.averaged(None).get("loss"), Some(&3.0));
        assert_eq!(buf.get("loss"), Some(2.0));
    }

    #[test]
    fn test_zero_count_falls_back_to_plain_mean() {
        let mut buf = LogBuffer::new();
        buf.update(&values(&[("x", 1.0)]), 0);
        buf.update(&values(&[("x", 2.0)]), 0);
        buf.average(None);
        assert_eq!(buf.get("x"), Some(1.5));
    }

    #[test]
    fn test_clear() {
        let mut buf = LogBuffer::new();
        buf.update(&values(&[("loss", 1.0)]), 1);
        buf.insert("lr", 0.1);
        buf.clear();
        assert!(buf.output().is_empty());
        assert_eq!(buf.count("loss"), 0);
        assert_eq!(buf.get("lr"), None);
    }
}
