//! Bounded, time-boxed key/value map
//!
//! Entries live for a fixed TTL and are pruned lazily on access. When the map
//! is full, the entry at the front of the order queue (oldest insertion, or
//! least recently touched when touch-on-read is enabled) is evicted.
//!
//! Time is passed in explicitly so callers can drive the cache from a paused
//! or simulated clock.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of live entries (expired ones may still be counted until pruned)
    pub entry_count: usize,

    /// Maximum number of entries
    pub capacity: usize,

    /// Number of lookups that found a fresh entry
    pub hits: u64,

    /// Number of lookups that found nothing or an expired entry
    pub misses: u64,

    /// Number of entries dropped to make room
    pub evictions: u64,

    /// Number of entries dropped because their TTL elapsed
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    stamped_at: Instant,
}

/// TTL map with insertion-order (or touch-order) eviction
#[derive(Debug, Clone)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,

    /// Eviction order (front is evicted first)
    order: VecDeque<K>,

    capacity: usize,
    ttl: Duration,
    touch_on_read: bool,
    stats: CacheStats,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries for `ttl` each
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            ttl,
            touch_on_read: false,
            stats: CacheStats {
                capacity,
                ..Default::default()
            },
        }
    }

    /// Refresh an entry's TTL and eviction position whenever it is read
    pub fn with_touch_on_read(mut self, touch: bool) -> Self {
        self.touch_on_read = touch;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of stored entries, including not-yet-pruned expired ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite `key`, stamping it with `now`
    ///
    /// Returns the keys evicted to stay within capacity.
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> Vec<K> {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                stamped_at: now,
            },
        );
        self.order.push_back(key);

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.evict_front() {
                Some(k) => evicted.push(k),
                None => break,
            }
        }
        self.stats.entry_count = self.entries.len();
        evicted
    }

    /// Look up a fresh entry
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&mut self, key: &K, now: Instant) -> Option<&V> {
        if !self.prune_if_expired(key, now) || !self.entries.contains_key(key) {
            self.stats.misses += 1;
            return None;
        }

        self.stats.hits += 1;
        if self.touch_on_read {
            self.touch(key, now);
        }
        self.entries.get(key).map(|e| &e.value)
    }

    /// Look up without counting stats or touching the entry
    pub fn peek(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| !self.is_expired(e, now))
            .map(|e| &e.value)
    }

    /// Check whether `key` has a fresh entry, without touching it
    pub fn contains(&self, key: &K, now: Instant) -> bool {
        self.peek(key, now).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        self.stats.entry_count = self.entries.len();
        Some(entry.value)
    }

    /// Drop every expired entry
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.stamped_at) >= self.ttl
    }

    /// Returns `false` if `key` was present but expired (and is now gone)
    fn prune_if_expired(&mut self, key: &K, now: Instant) -> bool {
        let expired = match self.entries.get(key) {
            Some(entry) => self.is_expired(entry, now),
            None => return true,
        };
        if expired {
            self.remove(key);
            self.stats.expirations += 1;
        }
        !expired
    }

    /// Move a key to the back of the order queue and restamp it
    fn touch(&mut self, key: &K, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.stamped_at = now;
        }
        self.order.retain(|k| k != key);
        self.order.push_back(key.clone());
    }

    fn evict_front(&mut self) -> Option<K> {
        let key = self.order.pop_front()?;
        self.entries.remove(&key);
        self.stats.evictions += 1;
        Some(key)
    }
}
