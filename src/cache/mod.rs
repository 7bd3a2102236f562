//! Sorted-run reader cache.
//!
//! Opening a run decodes its footer, metaindex, properties, both filter
//! blocks, and (inline mode) the interval block before the first byte of
//! data is served. A lookup touches a handful of runs, so the version set
//! keeps recently used readers resident here, keyed by file id. The cache
//! is read-through: a miss runs the caller's open and caches the result.
//! Compaction forgets retired files eagerly; everything else ages out by
//! capacity.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

pub struct ReaderCache<R> {
    readers: Mutex<LruCache<u64, Arc<R>>>,
    hits: AtomicU64,
    opens: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub opens: u64,
    pub evictions: u64,
    pub resident: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> Option<f64> {
        let lookups = self.hits.saturating_add(self.opens);
        if lookups == 0 {
            return None;
        }
        Some(self.hits as f64 / lookups as f64)
    }
}

impl<R> ReaderCache<R> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            readers: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the resident reader for `file_id`, or runs `open` and caches
    /// its result. The lock is not held across `open`, so two threads
    /// missing on the same file may both open it; the later one wins the
    /// slot and the earlier Arc just lives until its query finishes.
    pub fn get_or_open<E>(
        &self,
        file_id: u64,
        open: impl FnOnce() -> Result<R, E>,
    ) -> Result<Arc<R>, E> {
        if let Some(reader) = self.readers.lock().get(&file_id).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(reader);
        }

        let reader = Arc::new(open()?);
        self.opens.fetch_add(1, Ordering::Relaxed);
        let displaced = self.readers.lock().push(file_id, reader.clone());
        if displaced.is_some_and(|(old_id, _)| old_id != file_id) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(reader)
    }

    /// Drops a retired file's reader ahead of its natural eviction.
    pub fn forget(&self, file_id: u64) {
        self.readers.lock().pop(&file_id);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident: self.readers.lock().len(),
        }
    }
}

impl<R> std::fmt::Debug for ReaderCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderCache")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_through_caches_until_capacity() {
        let cache: ReaderCache<String> = ReaderCache::new(2);

        let first = cache.get_or_open::<()>(1, || Ok("a".to_string())).unwrap();
        let again = cache
            .get_or_open::<()>(1, || unreachable!("1 must be resident"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        cache.get_or_open::<()>(2, || Ok("b".to_string())).unwrap();
        cache.get_or_open::<()>(3, || Ok("c".to_string())).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.opens, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.resident, 2);
        assert!(stats.hit_rate().expect("hit rate") > 0.2);

        // 1 was least recently used and aged out; 2 and 3 are still warm.
        cache
            .get_or_open::<()>(3, || unreachable!("3 must be resident"))
            .unwrap();
        cache.get_or_open::<()>(1, || Ok("a".to_string())).unwrap();
        assert_eq!(cache.stats().opens, 4);
    }

    #[test]
    fn forget_drops_the_reader_immediately() {
        let cache: ReaderCache<u32> = ReaderCache::new(4);
        cache.get_or_open::<()>(7, || Ok(1)).unwrap();
        cache.forget(7);

        let reopened = cache.get_or_open::<()>(7, || Ok(2)).unwrap();
        assert_eq!(*reopened, 2);
        assert_eq!(cache.stats().opens, 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn open_failures_are_not_cached() {
        let cache: ReaderCache<u32> = ReaderCache::new(4);
        assert!(cache.get_or_open(9, || Err("bad footer")).is_err());
        assert_eq!(cache.stats().resident, 0);

        let ok = cache.get_or_open::<&str>(9, || Ok(5)).unwrap();
        assert_eq!(*ok, 5);
    }
}
