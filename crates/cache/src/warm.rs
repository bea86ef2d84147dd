//! Warm decode cache
//!
//! Remembers, per row, the last preview URL that decoded successfully. Rows
//! that are temporarily denied new loads (mid-scroll) can still show a
//! known-good image as long as it is exactly the URL they want now.

use crate::ttl::{CacheStats, TtlCache};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default number of remembered rows
pub const WARM_CAPACITY: usize = 2048;

/// Default lifetime of a remembered decode
pub const WARM_TTL: Duration = Duration::from_secs(10 * 60);

/// Thread-safe row → decoded URL map with TTL and touch-on-read
///
/// # Example
///
/// ```
/// use jobrow_cache::WarmDecodeCache;
///
/// let warm = WarmDecodeCache::default();
/// warm.mark("job-1", "asset://localhost/a.jpg");
///
/// assert!(warm.matches("job-1", "asset://localhost/a.jpg"));
/// assert!(!warm.matches("job-1", "asset://localhost/a.jpg?rev=2"));
/// ```
#[derive(Debug)]
pub struct WarmDecodeCache {
    entries: Mutex<TtlCache<String, String>>,
}

impl Default for WarmDecodeCache {
    fn default() -> Self {
        Self::new(WARM_CAPACITY, WARM_TTL)
    }
}

impl WarmDecodeCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(TtlCache::new(capacity, ttl).with_touch_on_read(true)),
        }
    }

    /// Record that `url` decoded successfully for `row_key`
    pub fn mark(&self, row_key: &str, url: &str) {
        self.mark_at(row_key, url, Instant::now());
    }

    pub fn mark_at(&self, row_key: &str, url: &str, now: Instant) {
        if row_key.is_empty() || url.is_empty() {
            return;
        }
        let evicted = self
            .entries
            .lock()
            .insert(row_key.to_string(), url.to_string(), now);
        if !evicted.is_empty() {
            trace!(count = evicted.len(), "warm cache evicted rows");
        }
    }

    /// Last decoded URL for `row_key`, refreshing the entry
    pub fn get(&self, row_key: &str) -> Option<String> {
        self.get_at(row_key, Instant::now())
    }

    pub fn get_at(&self, row_key: &str, now: Instant) -> Option<String> {
        self.entries.lock().get(&row_key.to_string(), now).cloned()
    }

    /// Check whether `row_key` last decoded exactly `url`
    pub fn matches(&self, row_key: &str, url: &str) -> bool {
        self.matches_at(row_key, url, Instant::now())
    }

    pub fn matches_at(&self, row_key: &str, url: &str, now: Instant) -> bool {
        self.get_at(row_key, now).is_some_and(|warm| warm == url)
    }

    pub fn forget(&self, row_key: &str) {
        self.entries.lock().remove(&row_key.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.lock().stats()
    }
}
