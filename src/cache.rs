//! Single-slot TTL cache
//!
//! Holds one serialized query response for the HTTP GET fast path. There is
//! no eviction beyond expiry; memory stays constant at one slot.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Slot {
    data: Vec<u8>,
    expires_at: Instant,
}

/// A cache for one binary payload with an expiry
#[derive(Default)]
pub struct SnapshotCache {
    slot: Mutex<Option<Slot>>,
}

impl SnapshotCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached payload, unless absent or expired
    pub fn get(&self) -> Option<Vec<u8>> {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.data.clone()),
            _ => None,
        }
    }

    /// Replace the payload, expiring `ttl` from now
    pub fn set(&self, data: Vec<u8>, ttl: Duration) {
        let mut slot = self.slot.lock();
        *slot = Some(Slot {
            data,
            expires_at: Instant::now() + ttl,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_misses() {
        let cache = SnapshotCache::new();
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn set_then_get() {
        let cache = SnapshotCache::new();
        cache.set(b"payload".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get().as_deref(), Some(b"payload".as_ref()));
    }

    #[test]
    fn expired_entry_misses() {
        let cache = SnapshotCache::new();
        cache.set(b"payload".to_vec(), Duration::ZERO);
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn set_replaces_previous_value() {
        let cache = SnapshotCache::new();
        cache.set(b"old".to_vec(), Duration::from_secs(60));
        cache.set(b"new".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get().as_deref(), Some(b"new".as_ref()));
    }
}
