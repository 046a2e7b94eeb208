use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Bounded `device_uid -> device id` map with least-recently-used eviction.
///
/// Eviction is purely capacity driven; entries never expire on their own.
#[derive(Debug)]
pub struct DeviceIdentityCache {
    entries: Mutex<LruCache<String, i64>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DeviceIdentityCache {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a device id and marks it most recently used.
    pub fn get(&self, device_uid: &str) -> Option<i64> {
        let found = self
            .entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.get(device_uid).copied());
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Inserts or refreshes an entry, evicting the least recently used one when full.
    pub fn set(&self, device_uid: &str, device_id: i64) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some((evicted, _)) = entries.push(device_uid.to_string(), device_id) {
                if evicted != device_uid {
                    tracing::trace!(device_uid = %evicted, "evicted device id from cache");
                }
            }
        }
    }

    pub fn remove(&self, device_uid: &str) -> Option<i64> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.pop(device_uid))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.cap().get())
            .unwrap_or(0)
    }

    /// `(hits, misses)` since creation.
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
