use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// ---------------------------------------------------------------------------
// Well-known series
// ---------------------------------------------------------------------------

pub const MESSAGES_ROUTED: &str = "bus_messages_routed_total";
pub const DELIVERY_FAILURES: &str = "bus_delivery_failures_total";
pub const REVIEWS: &str = "reviews_total";
pub const TASKS_FINISHED: &str = "tasks_finished_total";
pub const ALERTS_RAISED: &str = "alerts_raised_total";
pub const QUEUE_DEPTH: &str = "bus_queue_depth";

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing series of one counter family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    /// True when every pair of `filter` is present.
    fn contains(&self, filter: &Labels) -> bool {
        filter.0.iter().all(|pair| self.0.contains(pair))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// In-process counters and gauges shared by the bus and the agents.
///
/// Values are atomics; the maps are only write-locked to register a new
/// series. A poisoned lock is recovered since the data is plain counters.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<(String, Labels), AtomicI64>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = write(&self.counters);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    /// Value of one exact series.
    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every series of `name` carrying at least `labels`.
    pub fn sum_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let filter = Labels::new(labels);
        read(&self.counters)
            .iter()
            .filter(|((n, l), _)| n == name && l.contains(&filter))
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(&key) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(&key) {
                g.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges)
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Export -------------------------------------------------------------

    /// Every counter and gauge as `(name, labels, value)`, sorted for display.
    pub fn snapshot(&self) -> Vec<(String, Vec<(String, String)>, f64)> {
        let mut out: Vec<_> = read(&self.counters)
            .iter()
            .map(|((name, labels), v)| {
                (name.clone(), labels.0.clone(), v.load(Ordering::Relaxed) as f64)
            })
            .collect();
        out.extend(read(&self.gauges).iter().map(|((name, labels), v)| {
            (name.clone(), labels.0.clone(), v.load(Ordering::Relaxed) as f64)
        }));
        out.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        out
    }

    pub fn reset(&self) {
        write(&self.counters).clear();
        write(&self.gauges).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsCollector::new();
        m.increment_counter(MESSAGES_ROUTED, &[("kind", "assignment")]);
        m.increment_counter(MESSAGES_ROUTED, &[("kind", "assignment")]);
        m.increment_counter(MESSAGES_ROUTED, &[("kind", "completion")]);
        assert_eq!(m.get_counter(MESSAGES_ROUTED, &[("kind", "assignment")]), 2);
        assert_eq!(m.get_counter(MESSAGES_ROUTED, &[]), 0);
        assert_eq!(m.sum_counter(MESSAGES_ROUTED, &[]), 3);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsCollector::new();
        m.increment_counter(REVIEWS, &[("outcome", "rejected"), ("project", "p1")]);
        assert_eq!(
            m.get_counter(REVIEWS, &[("project", "p1"), ("outcome", "rejected")]),
            1
        );
        assert_eq!(m.sum_counter(REVIEWS, &[("project", "p1")]), 1);
        assert_eq!(m.sum_counter(REVIEWS, &[("project", "p2")]), 0);
    }

    #[test]
    fn gauges_set_and_add() {
        let m = MetricsCollector::new();
        m.set_gauge(QUEUE_DEPTH, &[("agent", "moderator")], 4);
        m.add_gauge(QUEUE_DEPTH, &[("agent", "moderator")], -1);
        assert_eq!(m.get_gauge(QUEUE_DEPTH, &[("agent", "moderator")]), 3);
    }

    #[test]
    fn snapshot_and_reset() {
        let m = MetricsCollector::new();
        m.increment_counter(ALERTS_RAISED, &[("severity", "critical")]);
        m.set_gauge(QUEUE_DEPTH, &[], 2);
        assert_eq!(m.snapshot().len(), 2);
        m.reset();
        assert!(m.snapshot().is_empty());
    }
}
