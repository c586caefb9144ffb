//! The bounded lookup cache in front of the mapping patterns.
//!
//! Entries record misses as well as matches, so a name that maps to nothing
//! does not re-run the pattern scan on every event carrying it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::telemetry::Telemetry;

use super::LookupResult;

pub(super) struct LookupCache {
    entries: Mutex<LruCache<String, Arc<LookupResult>>>,
}

impl LookupCache {
    pub(super) fn new(max_entries: usize) -> LookupCache {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        LookupCache { entries: Mutex::new(LruCache::new(capacity)) }
    }

    pub(super) fn get(&self, key: &str, telemetry: &Telemetry) -> Option<Arc<LookupResult>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(result) => {
                telemetry.cache.hits.inc();
                Some(result.clone())
            }
            None => {
                telemetry.cache.misses.inc();
                None
            }
        }
    }

    pub(super) fn put(&self, key: String, result: Arc<LookupResult>, telemetry: &Telemetry) {
        let mut entries = self.entries.lock();
        entries.put(key, result);
        telemetry.cache.size.set(entries.len() as f64);
    }

    pub(super) fn clear(&self, telemetry: &Telemetry) {
        let mut entries = self.entries.lock();
        entries.clear();
        telemetry.cache.size.set(0.0);
    }
}
