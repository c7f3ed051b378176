//! Model instantiation.

use super::device::Device;
use super::handle::{DType, HfTokenizer, LoadedBundle, TaskPipeline, TensorInfo, TensorModel};
use super::kind::ModelKind;
use super::registry::PublicRegistry;
use crate::storage::safe_relative;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use safetensors::SafeTensors;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// What to load.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub version: String,
    pub kind: ModelKind,
}

/// Where the files come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// A materialized directory (local cache or fresh download).
    Local(PathBuf),
    /// An identifier in the public registry.
    Public(String),
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Instantiate `spec` from `source`. The manager moves the result to `device`.
    async fn load(&self, spec: &ModelSpec, source: &ModelSource, device: &Device) -> Result<LoadedBundle>;
}

/// Buffer-name fragments (non-trainable state) by convention.
const BUFFER_MARKERS: &[&str] = &[
    "running_mean",
    "running_var",
    "num_batches_tracked",
    "position_ids",
    "token_type_ids",
    "masked_bias",
];

/// Loads model directories laid out like a Hugging Face checkout: `*.safetensors` or
/// `*.bin` weights, `tokenizer.json`, optional `config.json`.
pub struct FileModelLoader {
    registry: Option<Arc<dyn PublicRegistry>>,
    hub_cache: PathBuf,
}

impl FileModelLoader {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            registry: None,
            hub_cache: cache_dir.as_ref().join(".hub"),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn PublicRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    async fn materialize(&self, spec: &ModelSpec, source: &ModelSource) -> Result<PathBuf> {
        match source {
            ModelSource::Local(dir) => Ok(dir.clone()),
            ModelSource::Public(id) => {
                let registry = self.registry.as_ref().ok_or_else(|| {
                    Error::load_failure_with_context(
                        format!("{} is not stored locally and no public registry is configured", id),
                        ErrorContext::new().with_details(spec.name.clone()),
                    )
                })?;
                let rel = safe_relative(id).ok_or_else(|| {
                    Error::load_failure_with_context(
                        format!("public model id {:?} is not a relative path", id),
                        ErrorContext::new().with_details(spec.name.clone()),
                    )
                })?;
                registry.fetch(id, &self.hub_cache.join(rel)).await
            }
        }
    }
}

fn load_error(spec: &ModelSpec, msg: impl Into<String>) -> Error {
    Error::load_failure_with_context(
        msg,
        ErrorContext::new()
            .with_details(format!("{}:{}", spec.name, spec.version))
            .with_source("file_model_loader"),
    )
}

fn is_buffer_name(name: &str) -> bool {
    BUFFER_MARKERS.iter().any(|m| name.contains(m))
}

/// Tensor table of a safetensors file. Shapes whose byte size disagrees with the data
/// offsets (or overflows) are rejected.
pub async fn read_safetensors_header(path: &Path) -> Result<Vec<TensorInfo>> {
    let bytes = tokio::fs::read(path).await?;
    let (_, metadata) = SafeTensors::read_metadata(&bytes).map_err(|e| {
        Error::load_failure_with_context(
            format!("{}: invalid safetensors file: {}", path.display(), e),
            ErrorContext::new().with_source("safetensors"),
        )
    })?;

    let mut tensors = Vec::new();
    for (name, info) in metadata.tensors() {
        let dtype = DType::from_safetensors(info.dtype).ok_or_else(|| {
            Error::load_failure(format!(
                "{}: unsupported dtype {:?} for {}",
                path.display(),
                info.dtype,
                name
            ))
        })?;
        let tensor = TensorInfo {
            is_buffer: is_buffer_name(&name),
            dtype,
            shape: info.shape.iter().map(|d| *d as u64).collect(),
            name,
        };
        if tensor.checked_size_bytes().is_none() {
            return Err(Error::load_failure(format!(
                "{}: tensor {} is too large",
                path.display(),
                tensor.name
            )));
        }
        tensors.push(tensor);
    }
    tensors.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tensors)
}

async fn read_json(path: &Path) -> Result<Option<Value>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ModelLoader for FileModelLoader {
    async fn load(&self, spec: &ModelSpec, source: &ModelSource, _device: &Device) -> Result<LoadedBundle> {
        let dir = self.materialize(spec, source).await?;

        let mut weight_files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| load_error(spec, format!("cannot read {}: {}", dir.display(), e)))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("safetensors") | Some("bin") => weight_files.push(path),
                _ => {}
            }
        }
        weight_files.sort();
        if weight_files.is_empty() {
            return Err(load_error(spec, format!("no weight files in {}", dir.display())));
        }

        let mut tensors = Vec::new();
        for path in &weight_files {
            if path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
                tensors.extend(read_safetensors_header(path).await?);
            } else {
                let len = tokio::fs::metadata(path).await?.len();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                tensors.push(TensorInfo {
                    name,
                    dtype: DType::U8,
                    shape: vec![len],
                    is_buffer: false,
                });
            }
        }
        debug!(model = %spec.name, files = weight_files.len(), tensors = tensors.len(), "read weights");

        let tokenizer_path = dir.join("tokenizer.json");
        let tokenizer = if tokio::fs::metadata(&tokenizer_path).await.is_ok() {
            let tokenizer = HfTokenizer::from_file(&tokenizer_path)?;
            Some(Arc::new(tokenizer) as Arc<dyn super::Tokenizer>)
        } else if spec.kind.requires_tokenizer() {
            return Err(load_error(spec, "tokenizer.json not found"));
        } else {
            None
        };

        let pipeline = if spec.kind == ModelKind::Pipeline {
            let config = read_json(&dir.join("config.json")).await?;
            let task = config
                .as_ref()
                .and_then(|c| c.get("task").or_else(|| c.get("pipeline_tag")))
                .and_then(Value::as_str)
                .unwrap_or(spec.name.as_str())
                .to_string();
            Some(Arc::new(TaskPipeline::new(task, spec.name.clone())) as Arc<dyn super::Pipeline>)
        } else {
            None
        };

        Ok(LoadedBundle {
            model: Box::new(TensorModel::new(spec.name.clone(), spec.kind, tensors)),
            tokenizer,
            pipeline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;
    use serde_json::json;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"[UNK]": 0, "good": 1}, "unk_token": "[UNK]"}
    }"#;

    fn write_tensors(path: &Path, tensors: &[(&str, safetensors::Dtype, Vec<usize>)]) {
        let buffers: Vec<Vec<u8>> = tensors
            .iter()
            .map(|(_, dtype, shape)| vec![0u8; shape.iter().product::<usize>() * dtype.size()])
            .collect();
        let views: Vec<(&str, TensorView<'_>)> = tensors
            .iter()
            .zip(&buffers)
            .map(|((name, dtype, shape), data)| {
                (*name, TensorView::new(*dtype, shape.clone(), data).unwrap())
            })
            .collect();
        std::fs::write(path, safetensors::serialize(views, &None).unwrap()).unwrap();
    }

    fn write_raw_header(path: &Path, header: &Value) {
        let header = serde_json::to_vec(header).unwrap();
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&header);
        std::fs::write(path, bytes).unwrap();
    }

    fn spec(kind: ModelKind) -> ModelSpec {
        ModelSpec {
            name: "demo".into(),
            version: "latest".into(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_safetensors_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_tensors(
            &path,
            &[
                ("embeddings.position_ids", safetensors::Dtype::I64, vec![1, 512]),
                ("encoder.weight", safetensors::Dtype::F32, vec![64, 64]),
            ],
        );
        let tensors = read_safetensors_header(&path).await.unwrap();
        assert_eq!(tensors.len(), 2);
        assert!(tensors[0].is_buffer);
        assert_eq!(tensors[0].size_bytes(), 512 * 8);
        assert_eq!(tensors[1].size_bytes(), 64 * 64 * 4);
    }

    #[tokio::test]
    async fn test_oversized_shape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_raw_header(
            &path,
            &json!({"w": {"dtype": "F32", "shape": [4294967296u64, 4294967296u64, 16], "data_offsets": [0, 0]}}),
        );
        let err = read_safetensors_header(&path).await.unwrap_err();
        assert!(matches!(err, Error::LoadFailure { .. }));
    }

    #[tokio::test]
    async fn test_shape_must_match_data_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_raw_header(
            &path,
            &json!({"w": {"dtype": "F32", "shape": [1024, 1024], "data_offsets": [0, 16]}}),
        );
        assert!(read_safetensors_header(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_load_classification_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_tensors(
            &dir.path().join("model.safetensors"),
            &[("w", safetensors::Dtype::F32, vec![2, 2])],
        );
        std::fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL).unwrap();

        let bundle = FileModelLoader::new(dir.path())
            .load(
                &spec(ModelKind::Classification),
                &ModelSource::Local(dir.path().to_path_buf()),
                &Device::Cpu,
            )
            .await
            .unwrap();
        assert_eq!(bundle.model.resident_bytes(), 16);
        assert_eq!(bundle.tokenizer.unwrap().encode("good bad").unwrap(), vec![1, 0]);
        assert!(bundle.pipeline.is_none());
    }

    #[tokio::test]
    async fn test_missing_tokenizer_fails_except_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), vec![0u8; 32]).unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"task": "automatic-speech-recognition"}"#).unwrap();
        let loader = FileModelLoader::new(dir.path());
        let source = ModelSource::Local(dir.path().to_path_buf());

        let err = loader
            .load(&spec(ModelKind::Generic), &source, &Device::Cpu)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::LoadFailure { .. }));

        let bundle = loader
            .load(&spec(ModelKind::Pipeline), &source, &Device::Cpu)
            .await
            .unwrap();
        assert_eq!(bundle.model.resident_bytes(), 32);
        assert_eq!(bundle.pipeline.unwrap().task(), "automatic-speech-recognition");
    }

    #[tokio::test]
    async fn test_public_source_without_registry() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileModelLoader::new(dir.path())
            .load(
                &spec(ModelKind::Generic),
                &ModelSource::Public("org/model".into()),
                &Device::Cpu,
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::LoadFailure { .. }));
    }

    struct PanicRegistry;

    #[async_trait]
    impl PublicRegistry for PanicRegistry {
        async fn fetch(&self, _: &str, _: &Path) -> Result<PathBuf> {
            panic!("fetch must not be reached");
        }
        fn name(&self) -> &'static str {
            "panic"
        }
    }

    #[tokio::test]
    async fn test_public_id_outside_cache_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FileModelLoader::new(dir.path()).with_registry(Arc::new(PanicRegistry));
        for id in ["../../etc", "/abs/model"] {
            let err = loader
                .load(&spec(ModelKind::Generic), &ModelSource::Public(id.into()), &Device::Cpu)
                .await
                .err()
                .unwrap();
            assert!(matches!(err, Error::LoadFailure { .. }));
        }
    }
}
