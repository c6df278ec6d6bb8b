use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::classify::ClassifiedQuery;
use crate::clock::Clock;
use crate::error::Result;
use crate::scoring::SortOrder;

/// SHA-256 over the classified filters, vocabulary generation, pagination and sort.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyMaterial<'a> {
    kind: &'a str,
    vocabulary: u64,
    filters: &'a ClassifiedQuery,
    page: u32,
    limit: u32,
    sort: SortOrder,
}

impl CacheKey {
    pub fn new(
        kind: &str,
        vocabulary: u64,
        classified: &ClassifiedQuery,
        page: u32,
        limit: u32,
        sort: SortOrder,
    ) -> Self {
        // Segments carry input order only; the filters alone decide the result.
        let mut filters = classified.clone();
        filters.segments.clear();
        let material = KeyMaterial {
            kind,
            vocabulary,
            filters: &filters,
            page,
            limit,
            sort,
        };
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&material).unwrap_or_default());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

struct Shared<V> {
    entries: Mutex<LruCache<CacheKey, Entry<V>>>,
    generation: AtomicU64,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

/// Short-lived request results, dropped wholesale on invalidation.
///
/// Each entry is tied to the generation it was computed under; a result
/// that finishes after an invalidation is discarded instead of stored.
pub struct ResultCache<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for ResultCache<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: Clone> ResultCache<V> {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(LruCache::new(capacity)),
                generation: AtomicU64::new(0),
                ttl,
                clock,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = self.shared.clock.now();
        let mut entries = self.shared.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.stored_at) < self.shared.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Stores `value` if no invalidation happened since `generation` was read.
    pub fn insert(&self, key: CacheKey, value: V, generation: u64) -> bool {
        let mut entries = self.shared.entries.lock();
        if self.shared.generation.load(Ordering::Acquire) != generation {
            debug!(key = key.as_str(), "discarding result computed before invalidation");
            return false;
        }
        let stored_at = self.shared.clock.now();
        entries.put(key, Entry { value, stored_at });
        true
    }

    pub fn invalidate(&self) {
        let mut entries = self.shared.entries.lock();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    /// Cached value, or the result of `compute` stored under the current generation.
    pub async fn get_or_try_insert_with<F, Fut>(&self, key: CacheKey, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let generation = self.generation();
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = compute().await?;
        self.insert(key, value.clone(), generation);
        Ok(value)
    }
}
