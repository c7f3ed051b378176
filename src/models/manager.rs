//! Resident model table and load/unload lifecycle.

use super::device::{Accelerator, Device, NoAccelerator};
use super::eviction::{EvictionPolicy, NoEviction};
use super::handle::{ModelHandle, Pipeline, Tokenizer};
use super::kind::ModelKind;
use super::loader::{ModelLoader, ModelSource, ModelSpec};
use crate::events::{EventPublisher, LifecycleEvent};
use crate::storage::{safe_relative, ArtifactStore};
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version alias used when the caller does not pin one.
pub const LATEST: &str = "latest";

const MIB: f64 = 1024.0 * 1024.0;

/// Composite table key, `{name}:{version}`.
pub fn model_key(name: &str, version: &str) -> String {
    format!("{}:{}", name, version)
}

/// Bookkeeping for one resident model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedModelRecord {
    pub name: String,
    pub version: String,
    pub kind: ModelKind,
    pub size_bytes: u64,
    pub device: Device,
    pub loaded_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl LoadedModelRecord {
    pub fn key(&self) -> String {
        model_key(&self.name, &self.version)
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / MIB
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub total_models: usize,
    pub total_size_mb: f64,
    pub device: Device,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_allocated_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_reserved_mb: Option<f64>,
}

/// Record plus every handle that belongs to it; inserted and removed as one value.
struct ResidentModel {
    record: LoadedModelRecord,
    model: Arc<dyn ModelHandle>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    pipeline: Option<Arc<dyn Pipeline>>,
}

/// `None` while the leader is working, then whether the load succeeded.
type LoadSignal = watch::Receiver<Option<bool>>;

/// Removes the in-flight entry when the leading load finishes or is dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, LoadSignal>>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

enum Role {
    Leader(watch::Sender<Option<bool>>),
    Follower(LoadSignal),
}

/// Loads models on demand and tracks what is resident.
///
/// Concurrent first loads of the same `name:version` collapse into one: the first caller
/// does the work, the rest wait for its result. The resident table is only written after
/// every loading step succeeded, so an abandoned load leaves no trace.
pub struct ModelLifecycleManager {
    resident: RwLock<HashMap<String, ResidentModel>>,
    in_flight: Mutex<HashMap<String, LoadSignal>>,
    loader: Arc<dyn ModelLoader>,
    store: Option<Arc<ArtifactStore>>,
    events: Arc<EventPublisher>,
    eviction: Box<dyn EvictionPolicy>,
    accelerator: Arc<dyn Accelerator>,
    device: Device,
    cache_dir: PathBuf,
}

pub struct ModelLifecycleManagerBuilder {
    loader: Arc<dyn ModelLoader>,
    store: Option<Arc<ArtifactStore>>,
    events: Option<Arc<EventPublisher>>,
    eviction: Box<dyn EvictionPolicy>,
    accelerator: Arc<dyn Accelerator>,
    enable_gpu: bool,
    cache_dir: PathBuf,
}

impl ModelLifecycleManagerBuilder {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            store: None,
            events: None,
            eviction: Box::new(NoEviction),
            accelerator: Arc::new(NoAccelerator),
            enable_gpu: false,
            cache_dir: PathBuf::from("/models"),
        }
    }

    pub fn artifact_store(mut self, store: Arc<ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn events(mut self, events: Arc<EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn eviction(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.eviction = Box::new(policy);
        self
    }

    pub fn accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = accelerator;
        self
    }

    pub fn enable_gpu(mut self, enable: bool) -> Self {
        self.enable_gpu = enable;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Creates the cache directory and selects the device.
    pub fn build(self) -> Result<ModelLifecycleManager> {
        std::fs::create_dir_all(&self.cache_dir)?;
        if self.enable_gpu && !self.accelerator.is_available() {
            warn!(
                accelerator = self.accelerator.name(),
                "GPU requested but no accelerator is available, using cpu"
            );
        }
        let device = Device::select(self.enable_gpu, self.accelerator.as_ref());
        info!(
            device = %device,
            accelerator = self.accelerator.name(),
            eviction = self.eviction.name(),
            "model manager initialized"
        );
        Ok(ModelLifecycleManager {
            resident: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            loader: self.loader,
            store: self.store,
            events: self.events.unwrap_or_else(|| Arc::new(EventPublisher::noop())),
            eviction: self.eviction,
            accelerator: self.accelerator,
            device,
            cache_dir: self.cache_dir,
        })
    }
}

async fn has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

impl ModelLifecycleManager {
    pub fn builder(loader: Arc<dyn ModelLoader>) -> ModelLifecycleManagerBuilder {
        ModelLifecycleManagerBuilder::new(loader)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ResidentModel>> {
        self.resident.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ResidentModel>> {
        self.resident.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update last access; `false` if not resident.
    fn touch(&self, key: &str) -> bool {
        match self.write_table().get_mut(key) {
            Some(entry) => {
                entry.record.last_access = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Make `name:version` resident. Never fails past this boundary: the cause of a
    /// failed load is logged and published as `model.failed`.
    pub async fn load(&self, name: &str, kind: ModelKind, version: &str) -> bool {
        let key = model_key(name, version);
        loop {
            if self.touch(&key) {
                info!(model = %name, version = %version, "model already loaded");
                return true;
            }

            let role = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                match in_flight.get(&key) {
                    Some(signal) => Role::Follower(signal.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        in_flight: &self.in_flight,
                        key: key.clone(),
                    };
                    let ok = self.load_uncontended(name, kind, version, &key).await;
                    let _ = tx.send(Some(ok));
                    return ok;
                }
                Role::Follower(mut signal) => {
                    debug!(model = %name, version = %version, "waiting for in-flight load");
                    let outcome = loop {
                        let current = *signal.borrow_and_update();
                        if current.is_some() {
                            break current;
                        }
                        if signal.changed().await.is_err() {
                            break *signal.borrow();
                        }
                    };
                    match outcome {
                        Some(ok) => return ok,
                        // Leader was dropped before finishing; try again.
                        None => continue,
                    }
                }
            }
        }
    }

    async fn load_uncontended(&self, name: &str, kind: ModelKind, version: &str, key: &str) -> bool {
        let started = Instant::now();
        match self.instantiate(name, kind, version).await {
            Ok(resident) => {
                let size_mb = resident.record.size_mb();
                self.write_table().insert(key.to_string(), resident);
                let load_time_ms = started.elapsed().as_secs_f64() * 1000.0;
                info!(
                    model = %name,
                    version = %version,
                    size_mb = %format!("{:.2}", size_mb),
                    load_time_ms = load_time_ms as u64,
                    device = %self.device,
                    "loaded model"
                );
                self.events
                    .publish(LifecycleEvent::model_loaded(name, version, load_time_ms))
                    .await;
                self.apply_eviction(key);
                true
            }
            Err(e) => {
                error!(model = %name, version = %version, error = %e, "failed to load model");
                self.events
                    .publish(LifecycleEvent::model_failed(name, e.to_string()))
                    .await;
                false
            }
        }
    }

    async fn resolve_source(&self, name: &str, version: &str) -> ModelSource {
        let local = self.cache_dir.join(name).join(version);
        if has_entries(&local).await {
            return ModelSource::Local(local);
        }
        if let Some(store) = &self.store {
            info!(model = %name, version = %version, "downloading model from storage");
            if let Some(path) = store.download(name, version).await {
                return ModelSource::Local(path);
            }
        }
        info!(model = %name, "model not in storage, falling back to public registry");
        ModelSource::Public(name.to_string())
    }

    async fn instantiate(&self, name: &str, kind: ModelKind, version: &str) -> Result<ResidentModel> {
        if safe_relative(name).is_none() || safe_relative(version).is_none() {
            return Err(Error::load_failure_with_context(
                format!("model {}:{} does not name a directory below the cache", name, version),
                ErrorContext::new().with_source("model_manager"),
            ));
        }
        let source = self.resolve_source(name, version).await;
        let spec = ModelSpec {
            name: name.to_string(),
            version: version.to_string(),
            kind,
        };
        let bundle = self.loader.load(&spec, &source, &self.device).await?;

        let mut model = bundle.model;
        model.to_device(&self.device)?;
        model.set_inference_mode();
        let size_bytes = model.resident_bytes();

        let now = Utc::now();
        Ok(ResidentModel {
            record: LoadedModelRecord {
                name: spec.name,
                version: spec.version,
                kind,
                size_bytes,
                device: self.device,
                loaded_at: now,
                last_access: now,
            },
            model: Arc::from(model),
            tokenizer: bundle.tokenizer,
            pipeline: bundle.pipeline,
        })
    }

    fn apply_eviction(&self, just_loaded: &str) {
        let records: Vec<LoadedModelRecord> =
            self.read_table().values().map(|r| r.record.clone()).collect();
        for victim in self.eviction.select_victims(&records, just_loaded) {
            if victim == just_loaded {
                continue;
            }
            if self.unload_key(&victim) {
                info!(model = %victim, policy = self.eviction.name(), "evicted model");
            }
        }
    }

    /// Resident handle; touches last access. Never triggers a load.
    pub fn get(&self, name: &str, version: &str) -> Option<Arc<dyn ModelHandle>> {
        let mut table = self.write_table();
        let entry = table.get_mut(&model_key(name, version))?;
        entry.record.last_access = Utc::now();
        Some(entry.model.clone())
    }

    pub fn get_tokenizer(&self, name: &str, version: &str) -> Option<Arc<dyn Tokenizer>> {
        self.read_table()
            .get(&model_key(name, version))
            .and_then(|e| e.tokenizer.clone())
    }

    pub fn get_pipeline(&self, name: &str, version: &str) -> Option<Arc<dyn Pipeline>> {
        self.read_table()
            .get(&model_key(name, version))
            .and_then(|e| e.pipeline.clone())
    }

    pub fn is_loaded(&self, name: &str, version: &str) -> bool {
        self.read_table().contains_key(&model_key(name, version))
    }

    /// Drop the record and every handle of `name:version`; `false` if not resident.
    pub fn unload(&self, name: &str, version: &str) -> bool {
        let unloaded = self.unload_key(&model_key(name, version));
        if unloaded {
            info!(model = %name, version = %version, "unloaded model");
        }
        unloaded
    }

    fn unload_key(&self, key: &str) -> bool {
        let removed = self.write_table().remove(key);
        match removed {
            Some(resident) => {
                drop(resident);
                if self.device.is_accelerator() {
                    self.accelerator.release_cached();
                }
                true
            }
            None => false,
        }
    }

    /// Snapshot of every resident record.
    pub fn get_loaded_models(&self) -> HashMap<String, LoadedModelRecord> {
        self.read_table()
            .iter()
            .map(|(k, v)| (k.clone(), v.record.clone()))
            .collect()
    }

    pub fn get_memory_usage(&self) -> MemoryUsage {
        let table = self.read_table();
        let total_bytes = table
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.record.size_bytes));
        let (allocated, reserved) = if self.device.is_accelerator() {
            (
                Some(self.accelerator.allocated_bytes() as f64 / MIB),
                Some(self.accelerator.reserved_bytes() as f64 / MIB),
            )
        } else {
            (None, None)
        };
        MemoryUsage {
            total_models: table.len(),
            total_size_mb: total_bytes as f64 / MIB,
            device: self.device,
            device_allocated_mb: allocated,
            device_reserved_mb: reserved,
        }
    }

    /// Load each entry at `latest`, one after another. Failures are logged and skipped.
    pub async fn warmup<S: AsRef<str>>(&self, models: &[(S, ModelKind)]) -> usize {
        info!(count = models.len(), "warming up models");
        let mut loaded = 0;
        for (name, kind) in models {
            if self.load(name.as_ref(), *kind, LATEST).await {
                loaded += 1;
            } else {
                warn!(model = %name.as_ref(), "warmup load failed");
            }
        }
        loaded
    }
}
