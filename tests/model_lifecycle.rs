//! Model lifecycle against in-process storage, events and a recording loader.

use ai_ml_core::events::{EventPublisher, InMemoryEventSink};
use ai_ml_core::models::{
    Accelerator, DType, Device, FileModelLoader, LeastRecentlyUsed, LoadedBundle, ModelKind,
    ModelLifecycleManager, ModelLoader, ModelSource, ModelSpec, TensorInfo, TensorModel, LATEST,
};
use ai_ml_core::storage::{ArtifactStore, ArtifactStoreConfig, MemoryObjectStore};
use ai_ml_core::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUCKET: &str = "nexus-ai-models";

/// Records every call; builds a 1 MiB float model unless the name starts with `broken`.
#[derive(Default)]
struct RecordingLoader {
    calls: AtomicUsize,
    sources: Mutex<Vec<ModelSource>>,
    delay: Option<Duration>,
}

#[async_trait]
impl ModelLoader for RecordingLoader {
    async fn load(&self, spec: &ModelSpec, source: &ModelSource, _: &Device) -> Result<LoadedBundle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().unwrap().push(source.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if spec.name.starts_with("broken") {
            return Err(Error::load_failure("unsupported architecture"));
        }
        let tensors = vec![
            TensorInfo {
                name: "encoder.weight".into(),
                dtype: DType::F32,
                shape: vec![512, 512],
                is_buffer: false,
            },
            TensorInfo {
                name: "embeddings.position_ids".into(),
                dtype: DType::I64,
                shape: vec![1, 512],
                is_buffer: true,
            },
        ];
        Ok(LoadedBundle {
            model: Box::new(TensorModel::new(spec.name.clone(), spec.kind, tensors)),
            tokenizer: None,
            pipeline: None,
        })
    }
}

struct Harness {
    manager: ModelLifecycleManager,
    loader: Arc<RecordingLoader>,
    objects: Arc<MemoryObjectStore>,
    sink: Arc<InMemoryEventSink>,
    dir: tempfile::TempDir,
}

async fn harness(loader: RecordingLoader) -> Harness {
    harness_with(loader, |b| b).await
}

async fn harness_with(
    loader: RecordingLoader,
    configure: impl FnOnce(
        ai_ml_core::models::ModelLifecycleManagerBuilder,
    ) -> ai_ml_core::models::ModelLifecycleManagerBuilder,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(MemoryObjectStore::new());
    let store = Arc::new(ArtifactStore::new(
        ArtifactStoreConfig {
            cache_dir: dir.path().to_path_buf(),
            ..ArtifactStoreConfig::default()
        },
        objects.clone(),
    ));
    store.connect().await.unwrap();

    let sink = Arc::new(InMemoryEventSink::default());
    let events = Arc::new(EventPublisher::new(sink.clone(), "ai", "ai-ml-service"));
    events.connect(true).await.unwrap();

    let loader = Arc::new(loader);
    let builder = ModelLifecycleManager::builder(loader.clone())
        .artifact_store(store)
        .events(events)
        .cache_dir(dir.path());
    let manager = configure(builder).build().unwrap();
    Harness {
        manager,
        loader,
        objects,
        sink,
        dir,
    }
}

#[tokio::test]
async fn test_second_load_is_a_no_op() {
    let h = harness(RecordingLoader::default()).await;
    assert!(h.manager.load("demo-model", ModelKind::Classification, LATEST).await);
    let lists_after_first = h.objects.list_calls();

    assert!(h.manager.load("demo-model", ModelKind::Classification, LATEST).await);
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.objects.list_calls(), lists_after_first);
    assert_eq!(h.sink.events_of_type("ai.model.loaded").len(), 1);
}

#[tokio::test]
async fn test_missing_artifact_falls_back_to_public_source() {
    let h = harness(RecordingLoader::default()).await;
    assert!(h.manager.load("demo-model", ModelKind::parse("sentiment"), LATEST).await);

    assert_eq!(
        h.loader.sources.lock().unwrap().as_slice(),
        &[ModelSource::Public("demo-model".to_string())]
    );
    let loaded = h.manager.get_loaded_models();
    let record = &loaded["demo-model:latest"];
    assert!(record.size_mb() > 0.0);
    assert_eq!(record.kind, ModelKind::Classification);
    assert_eq!(record.device, Device::Cpu);
}

#[tokio::test]
async fn test_stored_artifact_is_downloaded_first() {
    let h = harness(RecordingLoader::default()).await;
    h.objects.insert(BUCKET, "translator/3/model.safetensors", vec![0u8; 16]);
    h.objects.insert(BUCKET, "translator/3/tokenizer.json", "{}");

    assert!(h.manager.load("translator", ModelKind::Translation, "3").await);
    let expected = h.dir.path().join("translator").join("3");
    assert_eq!(
        h.loader.sources.lock().unwrap().as_slice(),
        &[ModelSource::Local(expected.clone())]
    );
    assert!(expected.join("tokenizer.json").is_file());

    // After an unload the local copy is reused without touching the store.
    let gets = h.objects.get_calls();
    assert!(h.manager.unload("translator", "3"));
    assert!(h.manager.load("translator", ModelKind::Translation, "3").await);
    assert_eq!(h.objects.get_calls(), gets);
}

#[tokio::test]
async fn test_unload_removes_every_trace() {
    let h = harness(RecordingLoader::default()).await;
    assert!(h.manager.load("m", ModelKind::Generic, LATEST).await);
    assert!(h.manager.get("m", LATEST).is_some());

    assert!(h.manager.unload("m", LATEST));
    assert!(h.manager.get("m", LATEST).is_none());
    assert!(!h.manager.get_loaded_models().contains_key("m:latest"));
    assert!(!h.manager.is_loaded("m", LATEST));
    assert!(!h.manager.unload("m", LATEST));
    assert_eq!(h.manager.get_memory_usage().total_models, 0);
}

#[tokio::test]
async fn test_concurrent_loads_share_one_attempt() {
    let h = harness(RecordingLoader {
        delay: Some(Duration::from_millis(50)),
        ..RecordingLoader::default()
    })
    .await;
    let manager = &h.manager;

    let results = futures::future::join_all(
        (0..8).map(|_| manager.load("shared", ModelKind::Generic, LATEST)),
    )
    .await;
    assert!(results.iter().all(|ok| *ok));
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink.events_of_type("ai.model.loaded").len(), 1);
}

#[tokio::test]
async fn test_concurrent_failures_share_one_attempt() {
    let h = harness(RecordingLoader {
        delay: Some(Duration::from_millis(20)),
        ..RecordingLoader::default()
    })
    .await;
    let manager = &h.manager;
    let results = futures::future::join_all(
        (0..4).map(|_| manager.load("broken-model", ModelKind::Generic, LATEST)),
    )
    .await;
    assert!(results.iter().all(|ok| !*ok));
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 1);

    let failed = h.sink.events_of_type("ai.model.failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].data["model_name"], "broken-model");
    assert!(failed[0].data["error"]
        .as_str()
        .unwrap()
        .contains("unsupported architecture"));

    // A later call tries again.
    assert!(!h.manager.load("broken-model", ModelKind::Generic, LATEST).await);
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_warmup_counts_successes() {
    let h = harness(RecordingLoader::default()).await;
    let loaded = h
        .manager
        .warmup(&[
            ("a", ModelKind::Translation),
            ("broken-b", ModelKind::Generic),
            ("c", ModelKind::Pipeline),
        ])
        .await;
    assert_eq!(loaded, 2);
    let mut keys: Vec<String> = h.manager.get_loaded_models().into_keys().collect();
    keys.sort();
    assert_eq!(keys, vec!["a:latest", "c:latest"]);
}

#[tokio::test]
async fn test_lru_eviction_keeps_recently_used() {
    let h = harness_with(RecordingLoader::default(), |b| {
        b.eviction(LeastRecentlyUsed::new().with_max_models(2))
    })
    .await;
    assert!(h.manager.load("a", ModelKind::Generic, LATEST).await);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(h.manager.load("b", ModelKind::Generic, LATEST).await);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(h.manager.get("a", LATEST).is_some());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(h.manager.load("c", ModelKind::Generic, LATEST).await);

    assert!(h.manager.is_loaded("a", LATEST));
    assert!(!h.manager.is_loaded("b", LATEST));
    assert!(h.manager.is_loaded("c", LATEST));
}

struct FakeGpu {
    released: AtomicUsize,
}

impl Accelerator for FakeGpu {
    fn name(&self) -> &str {
        "fake-gpu"
    }
    fn is_available(&self) -> bool {
        true
    }
    fn allocated_bytes(&self) -> u64 {
        3 * 1024 * 1024
    }
    fn reserved_bytes(&self) -> u64 {
        4 * 1024 * 1024
    }
    fn release_cached(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_accelerator_placement_and_release() {
    let gpu = Arc::new(FakeGpu {
        released: AtomicUsize::new(0),
    });
    let accel = gpu.clone();
    let h = harness_with(RecordingLoader::default(), move |b| {
        b.enable_gpu(true).accelerator(accel)
    })
    .await;
    assert_eq!(h.manager.device(), Device::Cuda(0));

    assert!(h.manager.load("opus", ModelKind::Translation, LATEST).await);
    let handle = h.manager.get("opus", LATEST).unwrap();
    assert_eq!(handle.device(), Device::Cuda(0));
    // Parameters drop to half precision, the integer buffer keeps its width.
    assert_eq!(handle.resident_bytes(), 512 * 512 * 2 + 512 * 8);

    let usage = h.manager.get_memory_usage();
    assert_eq!(usage.device_allocated_mb, Some(3.0));
    assert_eq!(usage.device_reserved_mb, Some(4.0));

    assert!(h.manager.unload("opus", LATEST));
    assert_eq!(gpu.released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_corrupt_weights_report_failure() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("crafted").join(LATEST);
    std::fs::create_dir_all(&local).unwrap();
    let header = serde_json::to_vec(&serde_json::json!({
        "w": {"dtype": "F32", "shape": [4294967296u64, 4294967296u64, 16], "data_offsets": [0, 0]}
    }))
    .unwrap();
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&header);
    std::fs::write(local.join("model.safetensors"), bytes).unwrap();

    let sink = Arc::new(InMemoryEventSink::default());
    let events = Arc::new(EventPublisher::new(sink.clone(), "ai", "ai-ml-service"));
    events.connect(true).await.unwrap();
    let manager = ModelLifecycleManager::builder(Arc::new(FileModelLoader::new(dir.path())))
        .events(events)
        .cache_dir(dir.path())
        .build()
        .unwrap();

    assert!(!manager.load("crafted", ModelKind::Pipeline, LATEST).await);
    assert!(!manager.is_loaded("crafted", LATEST));
    assert_eq!(manager.get_memory_usage().total_models, 0);
    assert_eq!(sink.events_of_type("ai.model.failed").len(), 1);
}

#[tokio::test]
async fn test_names_outside_cache_are_refused() {
    let h = harness(RecordingLoader::default()).await;
    assert!(!h.manager.load("../escape", ModelKind::Generic, LATEST).await);
    assert!(!h.manager.load("demo", ModelKind::Generic, "../../v1").await);
    assert!(!h.manager.load("/abs", ModelKind::Generic, LATEST).await);
    assert_eq!(h.loader.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.objects.list_calls(), 0);
    assert_eq!(h.sink.events_of_type("ai.model.failed").len(), 3);
}
