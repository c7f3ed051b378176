//! # ai-ml-core
//!
//! AI/ML 服务的公共内核：推理结果缓存、模型制品存储与模型生命周期管理。
//!
//! Shared core for AI/ML inference services: an inference-result cache in front of a
//! key-value store, a versioned model artifact store on top of S3-compatible object
//! storage, and a lifecycle manager that lazily loads models onto the selected device.
//!
//! ## Core Philosophy
//!
//! - **Best-effort by default**: a dead cache or object store degrades to "miss" / "absent",
//!   never to an error in the request path
//! - **Deterministic keys**: the same logical request always maps to the same cache key
//! - **One load per model**: concurrent requests for a model share a single load
//! - **Strict startup when asked**: production deployments can refuse to start without
//!   their backends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_ml_core::{config::Settings, context::CoreContext, models::ModelKind};
//!
//! #[tokio::main]
//! async fn main() -> ai_ml_core::Result<()> {
//!     let settings = Settings::load(None)?;
//!     ai_ml_core::logging::init(&settings);
//!
//!     let core = CoreContext::from_settings(settings)?;
//!     core.start().await?;
//!
//!     let cached: Option<String> = core
//!         .cache()
//!         .get_translation("Hello", "en", "fr")
//!         .await?;
//!     if cached.is_none() {
//!         core.models()
//!             .load("Helsinki-NLP/opus-mt-en-fr", ModelKind::Translation, "latest")
//!             .await;
//!     }
//!
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Key derivation and the inference-result cache |
//! | [`storage`] | Object-store backends and the model artifact store |
//! | [`models`] | Model loading, residency tracking and eviction |
//! | [`events`] | CloudEvents lifecycle notifications |
//! | [`config`] | Settings from defaults, YAML and environment |
//! | [`context`] | Wiring and startup/shutdown of all components |
//! | [`logging`] | Tracing subscriber setup |
//! | [`outcome`] | Best-effort result type |

pub mod cache;
pub mod config;
pub mod context;
pub mod events;
pub mod logging;
pub mod models;
pub mod outcome;
pub mod storage;

// Re-export main types for convenience
pub use cache::{CacheNamespace, KeyDeriver, ResultCache, ResultCacheConfig};
pub use config::Settings;
pub use context::CoreContext;
pub use events::{EventPublisher, LifecycleEvent};
pub use models::{ModelKind, ModelLifecycleManager};
pub use outcome::{Degraded, Outcome};
pub use storage::{ArtifactStore, ModelArtifact};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
