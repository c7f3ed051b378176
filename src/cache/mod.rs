//! 结果缓存模块：按命名空间缓存推理结果，后端故障时自动降级。
//!
//! # Result Caching Module
//!
//! Caches inference results (translations, predictions, recommendations) in a shared
//! key-value store so repeated requests skip model execution.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResultCache`] | Namespace-aware cache with per-namespace TTLs and stats |
//! | [`KeyDeriver`] | Deterministic `{service}:{namespace}:{hash}` key derivation |
//! | [`KvBackend`] | Trait for key-value stores with expiry and cursor scans |
//! | [`RedisBackend`] | Redis implementation over a multiplexed connection |
//! | [`MemoryBackend`] | In-process backend with real expiry, for tests and local runs |
//! | [`NullBackend`] | Backend that stores nothing |
//!
//! ## Example
//!
//! ```rust
//! use ai_ml_core::cache::{MemoryBackend, ResultCache, ResultCacheConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> ai_ml_core::Result<()> {
//! let cache = ResultCache::new(ResultCacheConfig::default(), Arc::new(MemoryBackend::new()));
//! cache.connect().await?;
//! cache
//!     .set_translation("Hello", "en", "fr", &serde_json::json!({"text": "Bonjour"}))
//!     .await?;
//! let hit: Option<serde_json::Value> = cache.get_translation("Hello", "en", "fr").await?;
//! assert!(hit.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Degradation
//!
//! When the backend is unreachable the cache keeps working as a no-op: reads miss,
//! writes return `false`. The `fetch`/`store`/`remove`/`invalidate` forms return an
//! [`Outcome`](crate::Outcome) that says why.

mod backend;
mod key;
mod namespace;
mod redis;
mod result;

pub use backend::{KeyPattern, KvBackend, MemoryBackend, NullBackend};
pub use key::{KeyDeriver, DEFAULT_HASH_WIDTH};
pub use namespace::{CacheNamespace, NamespaceTtls};
pub use redis::RedisBackend;
pub use result::{CacheStats, ResultCache, ResultCacheConfig};
