//! 模型制品存储模块：在对象存储中按名称与版本管理模型文件。
//!
//! # Model Artifact Storage
//!
//! Stores model files under `{name}/{version}/` in a bucket and mirrors them into a
//! local cache directory on demand.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ArtifactStore`] | download / upload / list / exists with degraded-mode fallbacks |
//! | [`ObjectStore`] | Trait for bucket-oriented blob stores |
//! | [`S3ObjectStore`] | S3/MinIO over HTTP with SigV4 signing |
//! | [`FsObjectStore`] | Buckets as directories on a local filesystem |
//! | [`MemoryObjectStore`] | In-process store with outage and upload-failure switches |

mod artifact;
mod fs;
mod memory;
mod object;
mod s3;
pub mod sigv4;

pub use artifact::{ArtifactStore, ArtifactStoreConfig, ModelArtifact};
pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;
pub use object::{ObjectEntry, ObjectStore};
pub use s3::{S3Config, S3ObjectStore};

use std::path::{Component, Path, PathBuf};

/// `rel` as a path that stays below whatever it is joined onto, or `None` for empty,
/// absolute or `..`-bearing input.
pub(crate) fn safe_relative(rel: &str) -> Option<PathBuf> {
    let path = Path::new(rel);
    let ok = !rel.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    ok.then(|| path.to_path_buf())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_relative() {
        assert_eq!(safe_relative("config.json"), Some(PathBuf::from("config.json")));
        assert!(safe_relative("Helsinki-NLP/opus-mt-en-fr").is_some());
        assert!(safe_relative("../x").is_none());
        assert!(safe_relative("a/../../x").is_none());
        assert!(safe_relative("/etc/passwd").is_none());
        assert!(safe_relative("").is_none());
    }
}
