//! Monotonic counters.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by a fixed set of label values.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    series: DashMap<[String; N], u64>,
}

impl<const N: usize> LabeledCounter<N> {
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            series: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    pub fn inc(&self, labels: [&str; N]) {
        *self.series.entry(labels.map(str::to_string)).or_insert(0) += 1;
    }

    /// Value for one label combination, zero if never incremented.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        self.series
            .get(&labels.map(str::to_string))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Every series, sorted by labels.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        let mut all: Vec<_> = self
            .series
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("bids_total", "Bids placed");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.name(), "bids_total");
    }

    #[test]
    fn test_labeled_counter() {
        let skipped = LabeledCounter::new("ticks_skipped", "Skipped ticks", ["activity"]);
        skipped.inc(["renew"]);
        skipped.inc(["renew"]);
        skipped.inc(["discovery"]);

        assert_eq!(skipped.get(["renew"]), 2);
        assert_eq!(skipped.get(["health"]), 0);
        assert_eq!(
            skipped.get_all(),
            vec![(["discovery".to_string()], 1), (["renew".to_string()], 2)]
        );
    }
}
