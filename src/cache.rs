//! Object cache used for cache-aside loads.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::entity::NameHasher;
use crate::error::Result;

/// A byte cache with per-entry expiry. Implementations backed by cache
/// servers get their endpoints from `cache.servers` in the settings.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-process cache. Expired entries are dropped when read; a TTL too
/// large to represent never expires.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Option<Instant>, Vec<u8>), NameHasher>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock()?;
        let expired = match entries.get(key) {
            Some((expires, value)) if expires.is_none_or(|at| at > Instant::now()) => return Ok(Some(value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries.lock()?.insert(key.to_string(), (Instant::now().checked_add(ttl), value));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire() {
        let cache = MemoryCache::new();
        cache.set("a", b"one".to_vec(), Duration::from_secs(60)).unwrap();
        cache.set("b", b"two".to_vec(), Duration::ZERO).unwrap();
        assert_eq!(cache.get("a").unwrap(), Some(b"one".to_vec()));
        assert_eq!(cache.get("b").unwrap(), None);
        assert_eq!(cache.len(), 1);
        cache.delete("a").unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn huge_ttls_never_expire() {
        let cache = MemoryCache::new();
        cache.set("a", b"one".to_vec(), Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(cache.get("a").unwrap(), Some(b"one".to_vec()));
    }
}
