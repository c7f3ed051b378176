//! Process-wide wiring of the cache, artifact store, event publisher and model manager.

use crate::cache::{KvBackend, RedisBackend, ResultCache};
use crate::config::{Settings, StorageBackend};
use crate::events::{EventPublisher, EventSink, HttpEventSink, LogEventSink};
use crate::models::{
    Accelerator, FileModelLoader, HuggingFaceHub, LeastRecentlyUsed, ModelLifecycleManager,
    NoAccelerator,
};
use crate::storage::{ArtifactStore, FsObjectStore, ObjectStore, S3ObjectStore};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared handles owned by a running service.
pub struct CoreContext {
    settings: Settings,
    cache: Arc<ResultCache>,
    store: Arc<ArtifactStore>,
    events: Arc<EventPublisher>,
    models: Arc<ModelLifecycleManager>,
    started: AtomicBool,
}

fn object_store(settings: &Settings) -> Result<Arc<dyn ObjectStore>> {
    match settings.storage.backend {
        StorageBackend::Filesystem => Ok(Arc::new(FsObjectStore::new(settings.storage.root.clone()))),
        StorageBackend::S3 => {
            let mut config = settings.s3_config();
            match S3ObjectStore::new(config.clone()) {
                Ok(store) => Ok(Arc::new(store)),
                Err(e) if config.secret_key.is_none() && !settings.strict_startup() => {
                    warn!(error = %e, "object store secret missing; remote model storage will degrade");
                    config.secret_key = Some(String::new());
                    Ok(Arc::new(S3ObjectStore::new(config)?))
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn event_sink(settings: &Settings) -> Result<Arc<dyn EventSink>> {
    Ok(match settings.events.endpoint.as_deref() {
        Some(endpoint) => Arc::new(HttpEventSink::new(endpoint)?),
        None => Arc::new(LogEventSink),
    })
}

/// Builds a [`CoreContext`] from [`Settings`] plus runtime hooks settings cannot express.
pub struct CoreContextBuilder {
    settings: Settings,
    accelerator: Arc<dyn Accelerator>,
}

impl CoreContextBuilder {
    /// Accelerator runtime used for placement and memory accounting when `ENABLE_GPU` is set.
    pub fn accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Build every component. Nothing connects until [`CoreContext::start`].
    pub fn build(self) -> Result<CoreContext> {
        let settings = self.settings;
        let backend: Arc<dyn KvBackend> = Arc::new(RedisBackend::new(settings.cache.redis_url.clone()));
        let cache = Arc::new(ResultCache::new(settings.result_cache_config(), backend));

        let store = Arc::new(ArtifactStore::new(
            settings.artifact_store_config(),
            object_store(&settings)?,
        ));

        let events = Arc::new(EventPublisher::new(
            event_sink(&settings)?,
            settings.events.topic_prefix.clone(),
            settings.service_name.clone(),
        ));

        let hub = HuggingFaceHub::new(settings.models.hub_url.clone())?
            .with_token(settings.models.hub_token.clone());
        let loader = FileModelLoader::new(&settings.models.cache_dir).with_registry(Arc::new(hub));

        let builder = ModelLifecycleManager::builder(Arc::new(loader))
            .artifact_store(store.clone())
            .events(events.clone())
            .accelerator(self.accelerator)
            .enable_gpu(settings.models.enable_gpu)
            .cache_dir(settings.models.cache_dir.clone());
        let limits = (settings.models.max_resident_models, settings.models.max_resident_bytes);
        let builder = match limits {
            (None, None) => builder,
            (models, bytes) => builder.eviction(LeastRecentlyUsed {
                max_models: models,
                max_bytes: bytes,
            }),
        };
        let models = Arc::new(builder.build()?);

        Ok(CoreContext::from_parts(settings, cache, store, events, models))
    }
}

impl CoreContext {
    pub fn builder(settings: Settings) -> CoreContextBuilder {
        CoreContextBuilder {
            settings,
            accelerator: Arc::new(NoAccelerator),
        }
    }

    /// Build every component from settings without an accelerator runtime.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        Self::builder(settings).build()
    }

    pub fn from_parts(
        settings: Settings,
        cache: Arc<ResultCache>,
        store: Arc<ArtifactStore>,
        events: Arc<EventPublisher>,
        models: Arc<ModelLifecycleManager>,
    ) -> Self {
        Self {
            settings,
            cache,
            store,
            events,
            models,
            started: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventPublisher> {
        &self.events
    }

    pub fn models(&self) -> &Arc<ModelLifecycleManager> {
        &self.models
    }

    /// Connect every component, then warm up the configured models.
    ///
    /// Connection failures are fatal only under strict startup. Returns how many warmup
    /// models became resident.
    pub async fn start(&self) -> Result<usize> {
        let strict = self.settings.strict_startup();
        self.cache.connect().await?;
        self.store.connect().await?;
        self.events.connect(strict).await?;
        self.started.store(true, Ordering::SeqCst);

        let warmup = self.settings.warmup_models();
        let loaded = if warmup.is_empty() {
            0
        } else {
            self.models.warmup(&warmup).await
        };
        info!(
            service = %self.settings.service_name,
            environment = %self.settings.environment,
            cache_connected = self.cache.is_connected(),
            store_connected = self.store.is_connected(),
            warmed = loaded,
            "core started"
        );
        Ok(loaded)
    }

    /// Close connections. Resident models stay loaded. Safe to call more than once.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.events.close().await;
        self.store.disconnect().await;
        self.cache.disconnect().await;
        info!("core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBackend, ResultCacheConfig};
    use crate::events::InMemoryEventSink;
    use crate::models::{ModelKind, ModelLoader, ModelSource, ModelSpec};
    use crate::models::{Device, LoadedBundle, TensorModel};
    use crate::storage::{ArtifactStoreConfig, MemoryObjectStore};
    use async_trait::async_trait;

    struct EmptyLoader;

    #[async_trait]
    impl ModelLoader for EmptyLoader {
        async fn load(&self, spec: &ModelSpec, _: &ModelSource, _: &Device) -> Result<LoadedBundle> {
            Ok(LoadedBundle {
                model: Box::new(TensorModel::new(spec.name.clone(), spec.kind, Vec::new())),
                tokenizer: None,
                pipeline: None,
            })
        }
    }

    fn context(dir: &std::path::Path, warmup: &str) -> (CoreContext, Arc<MemoryBackend>) {
        let mut settings = Settings::default();
        settings.models.cache_dir = dir.to_path_buf();
        settings.models.warmup = crate::config::parse_warmup_list(warmup);

        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(ResultCache::new(ResultCacheConfig::default(), backend.clone()));
        let store = Arc::new(ArtifactStore::new(
            ArtifactStoreConfig {
                cache_dir: dir.to_path_buf(),
                ..ArtifactStoreConfig::default()
            },
            Arc::new(MemoryObjectStore::new()),
        ));
        let sink = Arc::new(InMemoryEventSink::default());
        let events = Arc::new(EventPublisher::new(sink, "ai", "test"));
        let models = Arc::new(
            ModelLifecycleManager::builder(Arc::new(EmptyLoader))
                .artifact_store(store.clone())
                .events(events.clone())
                .cache_dir(dir)
                .build()
                .unwrap(),
        );
        (CoreContext::from_parts(settings, cache, store, events, models), backend)
    }

    #[tokio::test]
    async fn test_start_warms_up_and_shutdown_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path(), "a:translation,b");
        assert_eq!(ctx.start().await.unwrap(), 2);
        assert!(ctx.cache().is_connected());
        assert!(ctx.models().is_loaded("b", "latest"));

        ctx.shutdown().await;
        assert!(!ctx.cache().is_connected());
        assert!(!ctx.store().is_connected());
        assert_eq!(ctx.models().get_loaded_models().len(), 2);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_degrades_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, backend) = context(dir.path(), "");
        backend.set_available(false);
        assert_eq!(ctx.start().await.unwrap(), 0);
        assert!(!ctx.cache().is_connected());
        assert!(ctx.models().load("m", ModelKind::Generic, "latest").await);
    }

    #[test]
    fn test_from_settings_filesystem_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.storage.backend = StorageBackend::Filesystem;
        settings.storage.root = dir.path().join("objects");
        settings.models.cache_dir = dir.path().join("models");
        settings.models.max_resident_models = Some(1);
        let ctx = CoreContext::from_settings(settings).unwrap();
        assert_eq!(ctx.store().bucket(), "nexus-ai-models");
        assert!(dir.path().join("models").is_dir());
    }

    struct StubGpu {
        released: std::sync::atomic::AtomicUsize,
    }

    impl Accelerator for StubGpu {
        fn name(&self) -> &str {
            "stub-gpu"
        }
        fn is_available(&self) -> bool {
            true
        }
        fn allocated_bytes(&self) -> u64 {
            2 * 1024 * 1024
        }
        fn reserved_bytes(&self) -> u64 {
            8 * 1024 * 1024
        }
        fn release_cached(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gpu_settings(dir: &std::path::Path) -> Settings {
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("ENABLE_GPU".to_string(), "true".to_string());
        overrides.insert("STORAGE_BACKEND".to_string(), "filesystem".to_string());
        let mut settings = Settings::default().with_overrides(&overrides).unwrap();
        settings.storage.root = dir.join("objects");
        settings.models.cache_dir = dir.join("models");
        settings
    }

    #[tokio::test]
    async fn test_builder_places_models_on_injected_accelerator() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("models").join("asr").join("latest");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("pytorch_model.bin"), vec![0u8; 256]).unwrap();

        let gpu = Arc::new(StubGpu {
            released: std::sync::atomic::AtomicUsize::new(0),
        });
        let ctx = CoreContext::builder(gpu_settings(dir.path()))
            .accelerator(gpu.clone())
            .build()
            .unwrap();
        assert_eq!(ctx.models().device(), Device::Cuda(0));

        let usage = ctx.models().get_memory_usage();
        assert_eq!(usage.device_allocated_mb, Some(2.0));
        assert_eq!(usage.device_reserved_mb, Some(8.0));

        assert!(ctx.models().load("asr", ModelKind::Pipeline, "latest").await);
        assert_eq!(ctx.models().get("asr", "latest").unwrap().device(), Device::Cuda(0));
        assert!(ctx.models().unload("asr", "latest"));
        assert_eq!(gpu.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gpu_without_accelerator_stays_on_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CoreContext::from_settings(gpu_settings(dir.path())).unwrap();
        assert!(ctx.settings().models.enable_gpu);
        assert_eq!(ctx.models().device(), Device::Cpu);
        assert_eq!(ctx.models().get_memory_usage().device_allocated_mb, None);
    }

    #[test]
    fn test_missing_secret_is_fatal_only_when_strict() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.models.cache_dir = dir.path().to_path_buf();
        assert!(CoreContext::from_settings(settings.clone()).is_ok());

        settings.strict_startup = Some(true);
        if cfg!(not(feature = "keyring")) {
            assert!(CoreContext::from_settings(settings).is_err());
        }
    }
}
