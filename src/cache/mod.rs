// Read-through cache of the storefront's views, invalidated by change events

use crate::entities::ProductOrdering;
use crate::errors::ServiceError;
use dashmap::DashMap;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identifies one cached view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewKey {
    ActiveProducts(ProductOrdering),
    Product(Uuid),
    Cart(Uuid),
    Orders(Uuid),
    Order(Uuid),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Debug)]
struct CachedValue {
    payload: String,
    generation: u64,
    stored_at: Instant,
}

/// Per-key state. `generation` moves on every invalidation; a value is only
/// served while it was fetched under the current generation.
#[derive(Debug, Default)]
struct Slot {
    generation: AtomicU64,
    fetch_lock: tokio::sync::Mutex<()>,
    value: Mutex<Option<CachedValue>>,
}

impl Slot {
    fn fresh_payload(&self, ttl: Option<Duration>) -> Option<String> {
        let value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = value.as_ref()?;
        if cached.generation != self.generation.load(Ordering::SeqCst) {
            return None;
        }
        if ttl.is_some_and(|ttl| cached.stored_at.elapsed() > ttl) {
            return None;
        }
        Some(cached.payload.clone())
    }

    fn store(&self, payload: String, generation: u64) {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        *value = Some(CachedValue {
            payload,
            generation,
            stored_at: Instant::now(),
        });
    }
}

/// Single-flight query cache.
///
/// Concurrent readers of the same key share one fetch. Any number of
/// invalidations between two reads costs exactly one re-fetch, and an
/// invalidation that lands while a fetch is in flight leaves that fetch's
/// result marked stale.
#[derive(Debug, Clone)]
pub struct QueryCache {
    slots: Arc<DashMap<ViewKey, Arc<Slot>>>,
    ttl: Option<Duration>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    invalidations: Arc<AtomicU64>,
}

impl QueryCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            ttl,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            invalidations: Arc::new(AtomicU64::new(0)),
        }
    }

    fn slot(&self, key: ViewKey) -> Arc<Slot> {
        self.slots.entry(key).or_default().clone()
    }

    /// Returns the cached view for `key`, running `fetch` on a miss.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: ViewKey, fetch: F) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let slot = self.slot(key);

        if let Some(value) = self.decode_hit(&key, slot.fresh_payload(self.ttl)) {
            return Ok(value);
        }

        let _flight = slot.fetch_lock.lock().await;
        // Another reader may have filled the slot while we waited
        if let Some(value) = self.decode_hit(&key, slot.fresh_payload(self.ttl)) {
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("costura_cache.miss", 1);
        debug!(?key, "Cache miss");

        let generation = slot.generation.load(Ordering::SeqCst);
        let value = fetch().await?;
        let payload = serde_json::to_string(&value).map_err(CacheError::from)?;
        slot.store(payload, generation);

        Ok(value)
    }

    fn decode_hit<T: DeserializeOwned>(&self, key: &ViewKey, payload: Option<String>) -> Option<T> {
        let payload = payload?;
        match serde_json::from_str(&payload) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("costura_cache.hit", 1);
                debug!(?key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(?key, "Failed to deserialize cached view: {}", e);
                None
            }
        }
    }

    /// Marks `key` stale. Idempotent; invalidating an uncached key is a no-op.
    pub fn invalidate(&self, key: &ViewKey) {
        if let Some(slot) = self.slots.get(key) {
            slot.generation.fetch_add(1, Ordering::SeqCst);
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            counter!("costura_cache.invalidation", 1);
            debug!(?key, "Cache invalidated");
        }
    }

    pub fn invalidate_where(&self, predicate: impl Fn(&ViewKey) -> bool) {
        for entry in self.slots.iter() {
            if predicate(entry.key()) {
                entry.value().generation.fetch_add(1, Ordering::SeqCst);
                self.invalidations.fetch_add(1, Ordering::Relaxed);
                counter!("costura_cache.invalidation", 1);
            }
        }
    }

    pub fn clear(&self) {
        self.invalidate_where(|_| true);
    }

    /// Whether a fresh value is currently held for `key`.
    pub fn is_cached(&self, key: &ViewKey) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.fresh_payload(self.ttl).is_some())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
    ) -> impl Future<Output = Result<Vec<String>, ServiceError>> {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(vec![format!("fetch-{}", n)])
        }
    }

    #[tokio::test]
    async fn second_read_is_a_hit() {
        let cache = QueryCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ViewKey::ActiveProducts(ProductOrdering::Newest);

        let first = cache.get_or_fetch(key, || counting_fetch(&calls)).await.unwrap();
        let second = cache.get_or_fetch(key, || counting_fetch(&calls)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn burst_of_invalidations_costs_one_refetch() {
        let cache = QueryCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ViewKey::Cart(Uuid::new_v4());

        cache.get_or_fetch(key, || counting_fetch(&calls)).await.unwrap();
        for _ in 0..25 {
            cache.invalidate(&key);
        }
        let value = cache.get_or_fetch(key, || counting_fetch(&calls)).await.unwrap();
        cache.get_or_fetch(key, || counting_fetch(&calls)).await.unwrap();

        assert_eq!(value, vec!["fetch-2".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_during_fetch_is_not_lost() {
        let cache = QueryCache::default();
        let key = ViewKey::Orders(Uuid::new_v4());

        let inner = cache.clone();
        let value = cache
            .get_or_fetch(key, || async move {
                // A change event lands while this read is still running
                inner.invalidate(&key);
                Ok::<_, ServiceError>(1u32)
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert!(!cache.is_cached(&key));
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_fetch() {
        let cache = QueryCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ViewKey::Product(Uuid::new_v4());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, ServiceError>("detail".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "detail");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_caches_nothing() {
        let cache = QueryCache::default();
        let key = ViewKey::Order(Uuid::new_v4());

        let result: Result<u32, _> = cache
            .get_or_fetch(key, || async { Err(ServiceError::Timeout("orders".into())) })
            .await;

        assert!(result.is_err());
        assert!(!cache.is_cached(&key));
    }

    #[tokio::test]
    async fn expired_values_are_refetched() {
        let cache = QueryCache::new(Some(Duration::from_millis(10)));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = ViewKey::ActiveProducts(ProductOrdering::Name);

        cache.get_or_fetch(key, || counting_fetch(&calls)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get_or_fetch(key, || counting_fetch(&calls)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_where_only_touches_matching_keys() {
        let cache = QueryCache::default();
        let user = Uuid::new_v4();
        let cart = ViewKey::Cart(user);
        let orders = ViewKey::Orders(user);

        cache.get_or_fetch(cart, || async { Ok::<_, ServiceError>(1u8) }).await.unwrap();
        cache.get_or_fetch(orders, || async { Ok::<_, ServiceError>(2u8) }).await.unwrap();

        cache.invalidate_where(|key| matches!(key, ViewKey::Orders(_)));

        assert!(cache.is_cached(&cart));
        assert!(!cache.is_cached(&orders));
        assert_eq!(cache.stats().invalidations, 1);
    }
}
