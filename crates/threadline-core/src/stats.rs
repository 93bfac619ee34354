use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Counters for relay traffic generated by thread fetches
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    /// Unified multi-relay queries issued
    pub unified_queries: u64,
    /// Single-relay queries issued on the fallback path
    pub relay_queries: u64,
    /// Failures by relay url ("all" for the unified query)
    pub relay_failures: HashMap<String, u64>,
    /// Notes received before deduplication
    pub notes_received: u64,
    pub fetches_completed: u64,
    pub fetches_cancelled: u64,
    pub fetches_failed: u64,
}

impl FetchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_failures(&self) -> u64 {
        self.relay_failures.values().sum()
    }

    /// Relays sorted by failure count (descending)
    pub fn failures_by_count(&self) -> Vec<(String, u64)> {
        let mut relays: Vec<_> = self
            .relay_failures
            .iter()
            .map(|(r, &c)| (r.clone(), c))
            .collect();
        relays.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        relays
    }
}

/// Thread-safe wrapper for fetch stats
#[derive(Debug, Clone, Default)]
pub struct SharedFetchStats {
    inner: Arc<RwLock<FetchStats>>,
}

impl SharedFetchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_unified_query(&self, received: usize) {
        let mut stats = self.inner.write();
        stats.unified_queries += 1;
        stats.notes_received += received as u64;
    }

    pub fn record_relay_query(&self, received: usize) {
        let mut stats = self.inner.write();
        stats.relay_queries += 1;
        stats.notes_received += received as u64;
    }

    pub fn record_relay_failure(&self, relay: &str) {
        *self
            .inner
            .write()
            .relay_failures
            .entry(relay.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_completed(&self) {
        self.inner.write().fetches_completed += 1;
    }

    pub fn record_cancelled(&self) {
        self.inner.write().fetches_cancelled += 1;
    }

    pub fn record_failed(&self) {
        self.inner.write().fetches_failed += 1;
    }

    pub fn snapshot(&self) -> FetchStats {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_stats_accumulate() {
        let stats = SharedFetchStats::new();
        let clone = stats.clone();

        stats.record_unified_query(3);
        clone.record_relay_query(2);
        clone.record_relay_failure("wss://a");
        clone.record_relay_failure("wss://b");
        clone.record_relay_failure("wss://b");
        stats.record_cancelled();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.unified_queries, 1);
        assert_eq!(snapshot.relay_queries, 1);
        assert_eq!(snapshot.notes_received, 5);
        assert_eq!(snapshot.total_failures(), 3);
        assert_eq!(
            snapshot.failures_by_count(),
            vec![("wss://b".to_string(), 2), ("wss://a".to_string(), 1)]
        );
        assert_eq!(snapshot.fetches_cancelled, 1);
    }
}
