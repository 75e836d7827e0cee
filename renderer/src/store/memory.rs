use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;

use super::{CacheStore, MAX_TTL, StoreError};

/// Entry limit used by [`MemoryStore::new`].
pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

/// Expires each entry after the TTL it was stored with.
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process store with per-entry expiry and a bounded entry count.
#[derive(Debug)]
pub struct MemoryStore {
    cache: Cache<String, Entry>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        MemoryStore {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryTtl)
                .build(),
        }
    }

    /// Number of live entries. Expired entries are evicted first.
    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        self.cache.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.cache.get(key).map(|entry| entry.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            // Already expired: drop any previous value instead of storing.
            self.cache.invalidate(key);
            return Ok(());
        }
        self.cache.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                ttl: ttl.min(MAX_TTL),
            },
        );
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.cache.invalidate_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v", Duration::from_secs(600)).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let store = MemoryStore::new();
        store.set("k", "old", Duration::from_secs(600)).unwrap();
        store.set("k", "v", Duration::ZERO).unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn expired_entries_are_evicted_without_being_read() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            store.set(&format!("user_{}", i), "v", Duration::from_millis(20)).unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn capacity_bounds_entry_count() {
        let store = MemoryStore::with_capacity(10);
        for i in 0..200 {
            store.set(&format!("k{}", i), "v", Duration::from_secs(600)).unwrap();
        }
        assert!(store.len() <= 10);
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn clear_drops_everything() {
        let store = MemoryStore::new();
        store.set("a", "1", Duration::from_secs(60)).unwrap();
        store.set("b", "2", Duration::from_secs(60)).unwrap();
        store.clear().unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert!(store.is_empty());
    }
}
