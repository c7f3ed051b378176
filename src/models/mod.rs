//! 模型生命周期模块：按需加载模型、跟踪常驻状态并在需要时卸载。
//!
//! # Model Lifecycle
//!
//! Lazily loads models from the local cache, the artifact store, or a public registry,
//! and keeps a table of what is resident on the selected device.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ModelLifecycleManager`] | load / get / unload / warmup with single-flight loads |
//! | [`ModelKind`] | Closed set of loading strategies |
//! | [`ModelLoader`] | Trait that turns a directory or public id into a resident handle |
//! | [`FileModelLoader`] | Reads safetensors metadata, `.bin` weights and `tokenizer.json` |
//! | [`PublicRegistry`] | Fallback source when the artifact store has no copy |
//! | [`HuggingFaceHub`] | Hugging Face Hub implementation of [`PublicRegistry`] |
//! | [`EvictionPolicy`] | Hook consulted after each load ([`NoEviction`], [`LeastRecentlyUsed`]) |
//! | [`Device`] / [`Accelerator`] | Device selection and accelerator memory accounting |
//!
//! ## Load order
//!
//! 1. Already resident: touch and return.
//! 2. `{cache_dir}/{name}/{version}` has files: load from there.
//! 3. Otherwise download from the artifact store.
//! 4. Otherwise hand the name to the public registry.

mod device;
mod eviction;
mod handle;
mod kind;
mod loader;
mod manager;
mod registry;

pub use device::{Accelerator, Device, NoAccelerator};
pub use eviction::{EvictionPolicy, LeastRecentlyUsed, NoEviction};
pub use handle::{
    DType, HfTokenizer, LoadedBundle, ModelHandle, Pipeline, TaskPipeline, TensorInfo, TensorModel,
    Tokenizer,
};
pub use kind::ModelKind;
pub use loader::{read_safetensors_header, FileModelLoader, ModelLoader, ModelSource, ModelSpec};
pub use manager::{
    model_key, LoadedModelRecord, MemoryUsage, ModelLifecycleManager,
    ModelLifecycleManagerBuilder, LATEST,
};
pub use registry::{HuggingFaceHub, PublicRegistry};
