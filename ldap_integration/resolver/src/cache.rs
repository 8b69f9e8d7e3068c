//! Memoisation of resolution results.
//!
//! A [CacheStore] holds opaque json values. Each backend sees the store through
//! a [BackendCache] that prefixes every key with the backend's configuration
//! prefix, so several servers can share one store without collisions.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value);

    async fn is_present(&self, key: &str) -> bool;

    async fn clear(&self);
}

/// Process local store. Bounded in size, and optionally in age.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, (Option<SystemTime>, Value)>>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    /// A `ttl` of zero keeps entries until they are evicted by size.
    pub fn new(size: usize, ttl: Duration) -> Self {
        MemoryCache {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl: Some(ttl).filter(|t| !t.is_zero()),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some((Some(expiry), _)) => *expiry <= SystemTime::now(),
            Some(_) => false,
            None => return None,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|(_, value)| value.clone())
    }

    async fn set(&self, key: &str, value: Value) {
        let expiry = self.ttl.map(|ttl| SystemTime::now() + ttl);
        self.entries
            .lock()
            .await
            .put(key.to_string(), (expiry, value));
    }

    async fn is_present(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

/// A store that never retains anything.
pub struct NoCache;

#[async_trait]
impl CacheStore for NoCache {
    async fn get(&self, _key: &str) -> Option<Value> {
        None
    }

    async fn set(&self, _key: &str, _value: Value) {}

    async fn is_present(&self, _key: &str) -> bool {
        false
    }

    async fn clear(&self) {}
}

#[derive(Clone)]
pub struct BackendCache {
    prefix: String,
    store: Arc<dyn CacheStore>,
}

impl BackendCache {
    pub fn new(prefix: &str, store: Arc<dyn CacheStore>) -> Self {
        BackendCache {
            prefix: prefix.to_string(),
            store,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.store.get(&self.key(key)).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(key, ?err, "discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => self.store.set(&self.key(key), v).await,
            Err(err) => warn!(key, ?err, "unable to encode cache entry"),
        }
    }

    pub async fn is_present(&self, key: &str) -> bool {
        self.store.is_present(&self.key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backend_cache_namespaces() {
        sketching::test_init();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(16, Duration::ZERO));
        let a = BackendCache::new("s01", store.clone());
        let b = BackendCache::new("s02", store.clone());

        a.set("inGroup:alice:admins", &true).await;
        assert_eq!(a.get::<bool>("inGroup:alice:admins").await, Some(true));
        assert!(b.get::<bool>("inGroup:alice:admins").await.is_none());
        assert!(!b.is_present("inGroup:alice:admins").await);
        assert!(store.is_present("s01inGroup:alice:admins").await);

        // Wrong shape reads as a miss.
        assert!(a.get::<Vec<String>>("inGroup:alice:admins").await.is_none());

        store.clear().await;
        assert!(!a.is_present("inGroup:alice:admins").await);
    }

    #[tokio::test]
    async fn test_memory_cache_expiry_and_size() {
        let cache = MemoryCache::new(2, Duration::from_millis(50));
        cache.set("a", Value::from(1)).await;
        assert_eq!(cache.get("a").await, Some(Value::from(1)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("a").await.is_none());

        let cache = MemoryCache::new(2, Duration::ZERO);
        cache.set("a", Value::from(1)).await;
        cache.set("b", Value::from(2)).await;
        cache.set("c", Value::from(3)).await;
        assert!(!cache.is_present("a").await);
        assert!(cache.is_present("c").await);

        let none = NoCache;
        none.set("a", Value::from(1)).await;
        assert!(none.get("a").await.is_none());
    }
}
