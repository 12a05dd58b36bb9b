//! Bounded key cache with TTL and max-size eviction.
//!
//! Fronts the durable `settled/` markers so repeated certification
//! notifications for the same record skip the store round trip.
//!
//! Each entry is roughly the key plus 16 bytes of bookkeeping, so the default
//! 100k entries for 32-byte ids stays under 5 MB.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_SETTLED_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_SETTLED_CACHE_TTL_SECS: u64 = 86_400; // 24 hours

/// Bounded set of keys with TTL and capacity limits.
///
/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are dropped before each insert.
pub struct BoundedCache<K> {
    map: HashMap<K, (u64, Instant)>,
    next_seq: u64,
    max_size: usize,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone> BoundedCache<K> {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            next_seq: 0,
            max_size: max_size.max(1),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.get(key).is_some_and(|(_, t)| t.elapsed() < self.ttl)
    }

    pub fn insert(&mut self, key: K) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.map.retain(|_, (_, t)| now.duration_since(*t) < ttl);
        if !self.map.contains_key(&key) {
            while self.map.len() >= self.max_size {
                // insertion order, not timestamps, decides the oldest
                let oldest = self
                    .map
                    .iter()
                    .min_by_key(|(_, (seq, _))| *seq)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        self.map.remove(&k);
                    }
                    None => break,
                }
            }
        }
        self.map.insert(key, (self.next_seq, now));
        self.next_seq += 1;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut cache = BoundedCache::new(10, 3600);
        let key = [1u8; 32];
        assert!(!cache.contains(&key));
        cache.insert(key);
        assert!(cache.contains(&key));
    }

    #[test]
    fn test_evicts_oldest() {
        let mut cache = BoundedCache::new(3, 3600);
        cache.insert([1u8; 32]);
        cache.insert([2u8; 32]);
        cache.insert([3u8; 32]);
        cache.insert([4u8; 32]);
        assert!(!cache.contains(&[1u8; 32]));
        assert!(cache.contains(&[2u8; 32]));
        assert!(cache.contains(&[4u8; 32]));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let mut cache = BoundedCache::new(2, 3600);
        cache.insert("a");
        cache.insert("b");
        cache.insert("b");
        assert!(cache.contains(&"a"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let mut cache = BoundedCache::new(10, 0);
        cache.insert(7u64);
        assert!(!cache.contains(&7));
    }
}
