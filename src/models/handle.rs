//! Capabilities of resident models and their companions.

use super::device::Device;
use super::kind::ModelKind;
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl DType {
    pub fn size_bytes(&self) -> u64 {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        use safetensors::Dtype as St;
        Some(match dtype {
            St::F64 => DType::F64,
            St::F32 => DType::F32,
            St::F16 => DType::F16,
            St::BF16 => DType::BF16,
            St::I64 => DType::I64,
            St::I32 => DType::I32,
            St::I16 => DType::I16,
            St::I8 => DType::I8,
            St::U8 => DType::U8,
            St::BOOL => DType::Bool,
            _ => return None,
        })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }
}

/// A named tensor: a trainable parameter or a non-trainable buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub is_buffer: bool,
}

impl TensorInfo {
    /// Element count, `None` on overflow.
    pub fn numel(&self) -> Option<u64> {
        self.shape.iter().try_fold(1u64, |acc, d| acc.checked_mul(*d))
    }

    /// Byte size at the current dtype, `None` on overflow.
    pub fn checked_size_bytes(&self) -> Option<u64> {
        self.numel()?.checked_mul(self.dtype.size_bytes())
    }

    /// Saturates at `u64::MAX`.
    pub fn size_bytes(&self) -> u64 {
        self.checked_size_bytes().unwrap_or(u64::MAX)
    }
}

/// A loaded model the manager can place, account for and hand out.
pub trait ModelHandle: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ModelKind;
    fn device(&self) -> Device;
    fn tensors(&self) -> &[TensorInfo];
    fn to_device(&mut self, device: &Device) -> Result<()>;
    fn set_inference_mode(&mut self);
    fn is_inference_mode(&self) -> bool;

    /// Parameter plus buffer bytes at the current precision.
    fn resident_bytes(&self) -> u64 {
        self.tensors()
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.size_bytes()))
    }
}

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn vocab_size(&self) -> usize;
}

pub trait Pipeline: Send + Sync {
    fn task(&self) -> &str;
    fn model_name(&self) -> &str;
}

/// What a loader produces: one resident handle plus optional companions.
pub struct LoadedBundle {
    pub model: Box<dyn ModelHandle>,
    pub tokenizer: Option<std::sync::Arc<dyn Tokenizer>>,
    pub pipeline: Option<std::sync::Arc<dyn Pipeline>>,
}

/// Tensor metadata model produced by [`FileModelLoader`](super::FileModelLoader).
#[derive(Debug, Clone)]
pub struct TensorModel {
    name: String,
    kind: ModelKind,
    tensors: Vec<TensorInfo>,
    device: Device,
    inference: bool,
}

impl TensorModel {
    pub fn new(name: impl Into<String>, kind: ModelKind, tensors: Vec<TensorInfo>) -> Self {
        Self {
            name: name.into(),
            kind,
            tensors,
            device: Device::Cpu,
            inference: false,
        }
    }
}

impl ModelHandle for TensorModel {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> ModelKind {
        self.kind
    }
    fn device(&self) -> Device {
        self.device
    }
    fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        if device.is_accelerator() && self.kind == ModelKind::Translation {
            for t in self.tensors.iter_mut().filter(|t| !t.is_buffer) {
                if matches!(t.dtype, DType::F32 | DType::F64) {
                    t.dtype = DType::F16;
                }
            }
        }
        self.device = *device;
        Ok(())
    }

    fn set_inference_mode(&mut self) {
        self.inference = true;
    }

    fn is_inference_mode(&self) -> bool {
        self.inference
    }
}

/// A `tokenizer.json` pipeline (normalizer, pre-tokenizer, model, decoder).
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

fn tokenizer_error(msg: impl Into<String>, e: impl std::fmt::Display) -> Error {
    Error::load_failure_with_context(
        format!("{}: {}", msg.into(), e),
        ErrorContext::new().with_source("tokenizer"),
    )
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| tokenizer_error(format!("cannot read {}", path.display()), e))?;
        Ok(Self { inner })
    }

    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| tokenizer_error("invalid tokenizer definition", e))?;
        Ok(Self { inner })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| tokenizer_error("encode failed", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| tokenizer_error("decode failed", e))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

pub struct TaskPipeline {
    task: String,
    model_name: String,
}

impl TaskPipeline {
    pub fn new(task: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            model_name: model_name.into(),
        }
    }
}

impl Pipeline for TaskPipeline {
    fn task(&self) -> &str {
        &self.task
    }
    fn model_name(&self) -> &str {
        &self.model_name
    }
}
