//! Inference-result cache.

use super::backend::KvBackend;
use super::key::KeyDeriver;
use super::namespace::{CacheNamespace, NamespaceTtls};
use crate::outcome::{Degraded, Outcome};
use crate::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    pub service_name: String,
    pub ttls: NamespaceTtls,
    /// Fail `connect` instead of degrading to a no-op cache.
    pub strict: bool,
    /// `COUNT` hint for each `SCAN` page during pattern invalidation.
    pub scan_page_size: usize,
    pub hash_width: usize,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            service_name: "ai-ml-service".to_string(),
            ttls: NamespaceTtls::default(),
            strict: false,
            scan_page_size: 100,
            hash_width: super::key::DEFAULT_HASH_WIDTH,
        }
    }
}

impl ResultCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }
    pub fn with_ttls(mut self, ttls: NamespaceTtls) -> Self {
        self.ttls = ttls;
        self
    }
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size.max(1);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Namespace-scoped, best-effort result cache over a [`KvBackend`].
///
/// Every operation round-trips to the backend. Backend faults never escape: reads
/// become misses, writes become `false`, invalidation returns what it managed to
/// delete. Only `connect` in strict mode returns an error.
pub struct ResultCache {
    config: ResultCacheConfig,
    backend: Arc<dyn KvBackend>,
    deriver: KeyDeriver,
    connected: AtomicBool,
    stats: AtomicStats,
}

impl ResultCache {
    pub fn new(config: ResultCacheConfig, backend: Arc<dyn KvBackend>) -> Self {
        let deriver = KeyDeriver::new(config.service_name.clone()).with_hash_width(config.hash_width);
        Self {
            config,
            backend,
            deriver,
            connected: AtomicBool::new(false),
            stats: AtomicStats::new(),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        match self.backend.connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(backend = self.backend.name(), "result cache connected");
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                error!(backend = self.backend.name(), error = %e, "failed to connect result cache");
                if self.config.strict {
                    Err(e)
                } else {
                    warn!("continuing without result cache");
                    Ok(())
                }
            }
        }
    }

    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.backend.disconnect().await {
                warn!(error = %e, "result cache disconnect failed");
            }
            info!("result cache disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn key_deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    pub fn config(&self) -> &ResultCacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Derive a key for `namespace` (see [`KeyDeriver::derive`]).
    pub fn make_key<A: Serialize + ?Sized>(&self, namespace: &CacheNamespace, args: &A) -> Result<String> {
        self.deriver.derive(namespace.as_str(), args)
    }

    /// Read `key`, reporting why a value is absent when the cache is degraded.
    pub async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Outcome<Option<T>> {
        if !self.is_connected() {
            return Outcome::Degraded(Degraded::NotConnected);
        }
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "cache hit");
                    Outcome::Ok(Some(value))
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "cached value could not be decoded");
                    Outcome::Degraded(Degraded::Codec(e.to_string()))
                }
            },
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Outcome::Ok(None)
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache get error");
                Outcome::Degraded(Degraded::Backend(e.to_string()))
            }
        }
    }

    /// Read `key`; any failure reads as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fetch(key).await.value_or_default()
    }

    /// Write `value` under `key` with `ttl`, or the generic default TTL when `None`.
    pub async fn store<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Outcome<()> {
        if !self.is_connected() {
            return Outcome::Degraded(Degraded::NotConnected);
        }
        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache value could not be encoded");
                return Outcome::Degraded(Degraded::Codec(e.to_string()));
            }
        };
        let ttl = ttl.unwrap_or(self.config.ttls.fallback);
        match self.backend.set_ex(key, &serialized, ttl).await {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
                Outcome::Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache set error");
                Outcome::Degraded(Degraded::Backend(e.to_string()))
            }
        }
    }

    /// Write `value`; returns whether it was stored.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        self.store(key, value, ttl).await.is_ok()
    }

    pub async fn remove(&self, key: &str) -> Outcome<()> {
        if !self.is_connected() {
            return Outcome::Degraded(Degraded::NotConnected);
        }
        match self.backend.delete(&[key.to_string()]).await {
            Ok(n) => {
                if n > 0 {
                    self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache delete error");
                Outcome::Degraded(Degraded::Backend(e.to_string()))
            }
        }
    }

    /// Delete `key`; `true` when the backend accepted the delete.
    pub async fn delete(&self, key: &str) -> bool {
        self.remove(key).await.is_ok()
    }

    /// Delete every key matching the glob `pattern`, one bounded `SCAN` page at a time.
    ///
    /// Returns the count deleted so far if the backend fails mid-scan.
    pub async fn invalidate(&self, pattern: &str) -> Outcome<u64> {
        if !self.is_connected() {
            return Outcome::Degraded(Degraded::NotConnected);
        }
        let mut cursor = 0u64;
        let mut deleted = 0u64;
        loop {
            let (next, keys) = match self
                .backend
                .scan(cursor, pattern, self.config.scan_page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => return self.partial_invalidation(pattern, deleted, e),
            };
            if !keys.is_empty() {
                match self.backend.delete(&keys).await {
                    Ok(n) => {
                        deleted += n;
                        self.stats.deletes.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(e) => return self.partial_invalidation(pattern, deleted, e),
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        info!(pattern = %pattern, deleted, "invalidated cache keys");
        Outcome::Ok(deleted)
    }

    fn partial_invalidation(&self, pattern: &str, deleted: u64, e: crate::Error) -> Outcome<u64> {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        warn!(pattern = %pattern, deleted, error = %e, "cache invalidation stopped early");
        Outcome::Ok(deleted)
    }

    /// Delete every key matching `pattern`; returns the number deleted (0 when degraded).
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        self.invalidate(pattern).await.value_or_default()
    }

    /// Drop every entry of `namespace` for this service.
    pub async fn invalidate_namespace(&self, namespace: &CacheNamespace) -> u64 {
        let pattern = self.deriver.namespace_pattern(namespace.as_str());
        self.invalidate_pattern(&pattern).await
    }

    /// Read a namespaced entry. Errors only when `args` cannot form a key.
    pub async fn get_namespaced<A, T>(&self, namespace: &CacheNamespace, args: &A) -> Result<Option<T>>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let key = self.make_key(namespace, args)?;
        Ok(self.get(&key).await)
    }

    /// Write a namespaced entry with the namespace's default TTL.
    pub async fn set_namespaced<A, T>(&self, namespace: &CacheNamespace, args: &A, value: &T) -> Result<bool>
    where
        A: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let key = self.make_key(namespace, args)?;
        let ttl = self.config.ttls.ttl_for(namespace);
        Ok(self.set(&key, value, Some(ttl)).await)
    }

    pub async fn get_translation<T: DeserializeOwned>(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Option<T>> {
        self.get_namespaced(&CacheNamespace::Translation, &(text, source_lang, target_lang))
            .await
    }

    pub async fn set_translation<T: Serialize + ?Sized>(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        result: &T,
    ) -> Result<bool> {
        self.set_namespaced(
            &CacheNamespace::Translation,
            &(text, source_lang, target_lang),
            result,
        )
        .await
    }

    pub async fn get_prediction<F, T>(&self, model_type: &str, features: &F) -> Result<Option<T>>
    where
        F: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.get_namespaced(&CacheNamespace::Prediction, &(model_type, features))
            .await
    }

    pub async fn set_prediction<F, T>(&self, model_type: &str, features: &F, result: &T) -> Result<bool>
    where
        F: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        self.set_namespaced(&CacheNamespace::Prediction, &(model_type, features), result)
            .await
    }

    pub async fn get_recommendation<T: DeserializeOwned>(
        &self,
        user_id: &str,
        context: &str,
        filters: Option<&Value>,
    ) -> Result<Option<T>> {
        self.get_namespaced(&CacheNamespace::Recommendation, &(user_id, context, filters))
            .await
    }

    pub async fn set_recommendation<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        context: &str,
        result: &T,
        filters: Option<&Value>,
    ) -> Result<bool> {
        self.set_namespaced(
            &CacheNamespace::Recommendation,
            &(user_id, context, filters),
            result,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use serde_json::json;

    async fn connected_cache() -> (ResultCache, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = ResultCache::new(ResultCacheConfig::default(), backend.clone());
        cache.connect().await.unwrap();
        (cache, backend)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (cache, _) = connected_cache().await;
        let doc = json!({"translated_text": "Bonjour", "confidence": 0.98});
        assert!(cache.set("k", &doc, Some(Duration::from_secs(60))).await);
        let back: Option<Value> = cache.get("k").await;
        assert_eq!(back, Some(doc));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_unconnected_cache_is_noop() {
        let cache = ResultCache::new(ResultCacheConfig::default(), Arc::new(MemoryBackend::new()));
        assert!(!cache.set("k", &1, None).await);
        assert_eq!(cache.get::<i32>("k").await, None);
        assert_eq!(
            cache.fetch::<i32>("k").await,
            Outcome::Degraded(Degraded::NotConnected)
        );
        assert!(!cache.delete("k").await);
        assert_eq!(cache.invalidate_pattern("*").await, 0);
    }

    #[tokio::test]
    async fn test_degraded_connect_in_lenient_mode() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let cache = ResultCache::new(ResultCacheConfig::default(), backend);
        assert!(cache.connect().await.is_ok());
        assert!(!cache.is_connected());
    }

    #[tokio::test]
    async fn test_strict_connect_fails() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let cache = ResultCache::new(ResultCacheConfig::default().with_strict(true), backend);
        assert!(cache.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_namespace_ttl_applied() {
        let (cache, backend) = connected_cache().await;
        assert!(cache
            .set_translation("Hello", "en", "fr", &json!({"t": "Bonjour"}))
            .await
            .unwrap());
        let key = cache
            .make_key(&CacheNamespace::Translation, &("Hello", "en", "fr"))
            .unwrap();
        let ttl = backend.ttl(&key).unwrap();
        assert!(ttl > Duration::from_secs(2_592_000 - 5));
    }

    #[tokio::test]
    async fn test_raw_set_uses_fallback_ttl() {
        let (cache, backend) = connected_cache().await;
        assert!(cache.set("raw", &1, None).await);
        let ttl = backend.ttl("raw").unwrap();
        assert!(ttl <= Duration::from_secs(3_600));
        assert!(ttl > Duration::from_secs(3_595));
    }

    #[tokio::test]
    async fn test_decode_failure_reads_as_miss() {
        let (cache, backend) = connected_cache().await;
        backend
            .set_ex("k", "not json", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            cache.fetch::<Value>("k").await,
            Outcome::Degraded(Degraded::Codec(_))
        ));
        assert_eq!(cache.get::<Value>("k").await, None);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (cache, _) = connected_cache().await;
        cache.disconnect().await;
        cache.disconnect().await;
        assert!(!cache.is_connected());
        assert!(!cache.set("k", &1, None).await);
    }
}
