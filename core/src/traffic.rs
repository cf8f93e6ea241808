//! Per-service traffic counters, grounded in
//! `original_source/go-gost/x/traffic/memory_manager.go`'s `MemoryManager`:
//! double-checked-locking insert, atomic 64-bit counters, and a
//! subtract-and-clamp "commit" operation used by the reporter.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

/// Upload/download counters for one service-key (`<service>:conn` or
/// `<service>:cc`).
#[derive(Default)]
struct Counters {
    upload: AtomicI64,
    download: AtomicI64,
}

/// A point-in-time, non-resetting snapshot of one service-key's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub upload: i64,
    pub download: i64,
}

/// Tracks per-service upload/download byte counters. The outer map is
/// guarded by a `RwLock` so a counter's pointer never races with deletion
/// from `ClearAllTrafficStats`; the counters themselves are lock-free
/// atomics so concurrent `RecordTraffic` calls for the same key never
/// contend on a mutex.
#[derive(Default)]
pub struct TrafficManager {
    stats: RwLock<HashMap<String, Counters>>,
}

impl TrafficManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additive; non-positive values are ignored.
    pub fn record_traffic(&self, service_key: &str, up: i64, down: i64) {
        if up <= 0 && down <= 0 {
            return;
        }
        if let Some(counters) = self.stats.read().expect("traffic lock poisoned").get(service_key) {
            if up > 0 {
                counters.upload.fetch_add(up, Ordering::Relaxed);
            }
            if down > 0 {
                counters.download.fetch_add(down, Ordering::Relaxed);
            }
            return;
        }
        let mut guard = self.stats.write().expect("traffic lock poisoned");
        let counters = guard.entry(service_key.to_string()).or_insert_with(Counters::default);
        if up > 0 {
            counters.upload.fetch_add(up, Ordering::Relaxed);
        }
        if down > 0 {
            counters.download.fetch_add(down, Ordering::Relaxed);
        }
    }

    /// Snapshot without resetting any counter.
    pub fn get_all_services_stats(&self) -> HashMap<String, Stats> {
        self.stats
            .read()
            .expect("traffic lock poisoned")
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    Stats {
                        upload: v.upload.load(Ordering::Relaxed),
                        download: v.download.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    /// Subtracts `delta` from each named key's counters, clamping at zero.
    /// Used by the reporter to "commit" a successfully-published delta
    /// while preserving bytes recorded concurrently with the publish.
    pub fn subtract_traffic_stats(&self, delta: &HashMap<String, Stats>) {
        let guard = self.stats.read().expect("traffic lock poisoned");
        for (key, d) in delta {
            if let Some(counters) = guard.get(key) {
                subtract_clamped(&counters.upload, d.upload);
                subtract_clamped(&counters.download, d.download);
            }
        }
    }

    /// Zeroes every counter.
    pub fn clear_all_traffic_stats(&self) {
        let guard = self.stats.read().expect("traffic lock poisoned");
        for counters in guard.values() {
            counters.upload.store(0, Ordering::Relaxed);
            counters.download.store(0, Ordering::Relaxed);
        }
    }
}

fn subtract_clamped(counter: &AtomicI64, amount: i64) {
    if amount <= 0 {
        return;
    }
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = (current - amount).max(0);
        match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_snapshot() {
        let mgr = TrafficManager::new();
        mgr.record_traffic("s1:conn", 10, 20);
        mgr.record_traffic("s1:conn", 5, 0);
        let snap = mgr.get_all_services_stats();
        assert_eq!(snap["s1:conn"], Stats { upload: 15, download: 20 });
    }

    #[test]
    fn non_positive_values_are_ignored() {
        let mgr = TrafficManager::new();
        mgr.record_traffic("s1:conn", -5, 0);
        assert!(mgr.get_all_services_stats().is_empty());
    }

    #[test]
    fn subtract_clamps_at_zero() {
        let mgr = TrafficManager::new();
        mgr.record_traffic("s1:conn", 10, 10);
        let mut delta = HashMap::new();
        delta.insert("s1:conn".to_string(), Stats { upload: 100, download: 3 });
        mgr.subtract_traffic_stats(&delta);
        let snap = mgr.get_all_services_stats();
        assert_eq!(snap["s1:conn"], Stats { upload: 0, download: 7 });
    }

    #[test]
    fn clear_zeroes_everything() {
        let mgr = TrafficManager::new();
        mgr.record_traffic("s1:conn", 10, 10);
        mgr.clear_all_traffic_stats();
        assert_eq!(mgr.get_all_services_stats()["s1:conn"], Stats::default());
    }
}
