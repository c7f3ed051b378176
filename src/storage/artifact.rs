//! Versioned model artifacts on top of an [`ObjectStore`].

use super::object::{ObjectEntry, ObjectStore};
use super::safe_relative;
use crate::outcome::{Degraded, Outcome};
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    pub bucket: String,
    /// Local root that downloads are materialized under (`{cache_dir}/{name}/{version}`).
    pub cache_dir: PathBuf,
    pub strict: bool,
}

impl Default for ArtifactStoreConfig {
    fn default() -> Self {
        Self {
            bucket: "nexus-ai-models".to_string(),
            cache_dir: PathBuf::from("/models"),
            strict: false,
        }
    }
}

/// A stored `(name, version)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: String,
    /// Object prefix, `{name}/{version}/`.
    pub path: String,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

pub struct ArtifactStore {
    backend: Arc<dyn ObjectStore>,
    config: ArtifactStoreConfig,
    connected: AtomicBool,
}

fn version_prefix(name: &str, version: &str) -> String {
    format!("{}/{}/", name, version)
}

/// Relative path made only of normal components, or `None`.
impl ArtifactStore {
    pub fn new(config: ArtifactStoreConfig, backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend,
            config,
            connected: AtomicBool::new(false),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    /// Where `download` places `(name, version)`.
    pub fn local_path(&self, name: &str, version: &str) -> PathBuf {
        self.config.cache_dir.join(name).join(version)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Verify the backend and make sure the bucket exists.
    pub async fn connect(&self) -> Result<()> {
        match self.ensure_bucket().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(backend = self.backend.name(), bucket = %self.config.bucket, "artifact store connected");
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                error!(backend = self.backend.name(), error = %e, "failed to connect artifact store");
                if self.config.strict {
                    Err(Error::connection_with_context(
                        e.to_string(),
                        crate::ErrorContext::new()
                            .with_details(self.config.bucket.clone())
                            .with_source("artifact_store"),
                    ))
                } else {
                    warn!("continuing without remote model storage");
                    Ok(())
                }
            }
        }
    }

    async fn ensure_bucket(&self) -> Result<()> {
        if !self.backend.bucket_exists(&self.config.bucket).await? {
            self.backend.create_bucket(&self.config.bucket).await?;
            info!(bucket = %self.config.bucket, "created model bucket");
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("artifact store disconnected");
        }
    }

    /// Fetch every object of `(name, version)` into the local cache.
    ///
    /// `Ok(None)` means the store holds nothing for this version. Objects are written to a
    /// staging directory first and moved into place once all of them arrived.
    pub async fn download_outcome(&self, name: &str, version: &str) -> Outcome<Option<PathBuf>> {
        if !self.is_connected() {
            warn!(model = %name, "cannot download model: artifact store not connected");
            return Outcome::Degraded(Degraded::NotConnected);
        }
        match self.download_inner(name, version).await {
            Ok(found) => Outcome::Ok(found),
            Err(e) => {
                error!(model = %name, version = %version, error = %e, "failed to download model");
                Outcome::Degraded(Degraded::Backend(e.to_string()))
            }
        }
    }

    pub async fn download(&self, name: &str, version: &str) -> Option<PathBuf> {
        self.download_outcome(name, version).await.value_or_default()
    }

    async fn download_inner(&self, name: &str, version: &str) -> Result<Option<PathBuf>> {
        let (Some(_), Some(_)) = (safe_relative(name), safe_relative(version)) else {
            warn!(model = %name, version = %version, "refusing to download unsafe model path");
            return Ok(None);
        };
        let prefix = version_prefix(name, version);
        let listing = self
            .backend
            .list(&self.config.bucket, &prefix, true)
            .await?;

        let files: Vec<(ObjectEntry, PathBuf)> = listing
            .into_iter()
            .filter(|o| !o.is_directory_marker())
            .filter_map(|o| {
                let rel = o.key.strip_prefix(&prefix)?.to_string();
                match safe_relative(&rel) {
                    Some(path) => Some((o, path)),
                    None => {
                        warn!(key = %o.key, "skipping object outside model prefix");
                        None
                    }
                }
            })
            .collect();

        if files.is_empty() {
            warn!(model = %name, version = %version, "no files found for model");
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        let staging = self
            .config
            .cache_dir
            .join(format!(".staging-{}", uuid::Uuid::new_v4()));
        if let Err(e) = self.fetch_all(&files, &staging).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        let target = self.local_path(name, version);
        if tokio::fs::metadata(&target).await.is_ok() {
            tokio::fs::remove_dir_all(&target).await?;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&staging, &target).await?;

        info!(
            model = %name,
            version = %version,
            files = files.len(),
            path = %target.display(),
            "downloaded model"
        );
        Ok(Some(target))
    }

    async fn fetch_all(&self, files: &[(ObjectEntry, PathBuf)], staging: &Path) -> Result<()> {
        for (object, rel) in files {
            let dest = staging.join(rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.backend
                .get_to_file(&self.config.bucket, &object.key, &dest)
                .await?;
        }
        Ok(())
    }

    /// Upload every regular file under `local_dir` to `{name}/{version}/`.
    ///
    /// Stops at the first failed file. Files already sent stay in the store, but the
    /// upload as a whole is reported degraded.
    pub async fn upload_outcome(&self, name: &str, version: &str, local_dir: &Path) -> Outcome<bool> {
        if !self.is_connected() {
            warn!(model = %name, "cannot upload model: artifact store not connected");
            return Outcome::Degraded(Degraded::NotConnected);
        }
        match self.upload_inner(name, version, local_dir).await {
            Ok(count) => {
                info!(model = %name, version = %version, files = count, "uploaded model");
                Outcome::Ok(true)
            }
            Err(e) => {
                error!(model = %name, version = %version, error = %e, "failed to upload model");
                Outcome::Degraded(Degraded::Backend(e.to_string()))
            }
        }
    }

    pub async fn upload(&self, name: &str, version: &str, local_dir: &Path) -> bool {
        self.upload_outcome(name, version, local_dir).await.value_or(false)
    }

    async fn upload_inner(&self, name: &str, version: &str, local_dir: &Path) -> Result<usize> {
        if !tokio::fs::metadata(local_dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(Error::not_found_with_context(
                format!("local path does not exist: {}", local_dir.display()),
                crate::ErrorContext::new().with_source("artifact_store"),
            ));
        }

        let root = local_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&root))
            .await
            .map_err(|e| Error::backend(format!("file walk task failed: {}", e)))??;

        let prefix = version_prefix(name, version);
        for (path, rel) in &files {
            let body = Bytes::from(tokio::fs::read(path).await?);
            self.backend
                .put(&self.config.bucket, &format!("{}{}", prefix, rel), body)
                .await?;
        }
        Ok(files.len())
    }

    /// Every `(name, version)` in the bucket, with sizes summed over the version prefix.
    pub async fn list_outcome(&self) -> Outcome<Vec<ModelArtifact>> {
        if !self.is_connected() {
            return Outcome::Degraded(Degraded::NotConnected);
        }
        match self.list_inner().await {
            Ok(models) => Outcome::Ok(models),
            Err(e) => {
                error!(error = %e, "failed to list models");
                Outcome::Degraded(Degraded::Backend(e.to_string()))
            }
        }
    }

    pub async fn list(&self) -> Vec<ModelArtifact> {
        self.list_outcome().await.value_or_default()
    }

    async fn list_inner(&self) -> Result<Vec<ModelArtifact>> {
        let bucket = &self.config.bucket;
        let mut models = Vec::new();
        for top in self.backend.list(bucket, "", false).await? {
            if !top.is_dir {
                continue;
            }
            let name = top.key.trim_end_matches('/').to_string();
            let versions = self
                .backend
                .list(bucket, &format!("{}/", name), false)
                .await?;
            for entry in versions.into_iter().filter(|v| v.is_dir) {
                let version = entry.key[name.len() + 1..].trim_end_matches('/').to_string();
                let objects = self.backend.list(bucket, &entry.key, true).await?;
                let size_bytes = objects.iter().map(|o| o.size).sum();
                let last_modified = objects.iter().filter_map(|o| o.last_modified).max();
                models.push(ModelArtifact {
                    name: name.clone(),
                    version,
                    path: entry.key.clone(),
                    size_bytes,
                    last_modified,
                });
            }
        }
        Ok(models)
    }

    /// Advisory existence check; any backend error reads as `false`.
    pub async fn exists(&self, name: &str, version: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self
            .backend
            .list(&self.config.bucket, &version_prefix(name, version), false)
            .await
        {
            Ok(entries) => !entries.is_empty(),
            Err(e) => {
                warn!(model = %name, version = %version, error = %e, "model existence check failed");
                false
            }
        }
    }
}

/// Regular files under `root` with their `/`-joined relative paths, sorted.
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| Error::backend(format!("cannot walk {}: {}", root.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), key));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn store_with(backend: Arc<MemoryObjectStore>, cache_dir: &Path) -> ArtifactStore {
        ArtifactStore::new(
            ArtifactStoreConfig {
                bucket: "models".into(),
                cache_dir: cache_dir.to_path_buf(),
                strict: false,
            },
            backend,
        )
    }

    #[tokio::test]
    async fn test_connect_creates_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend.clone(), dir.path());
        store.connect().await.unwrap();
        assert!(store.is_connected());
        assert!(backend.bucket_exists("models").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_skips_markers_and_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryObjectStore::new());
        backend.insert("models", "bert/1/", Bytes::new());
        backend.insert("models", "bert/1/config.json", "{}");
        backend.insert("models", "bert/1/onnx/", Bytes::new());
        backend.insert("models", "bert/1/onnx/model.onnx", "weights");
        backend.insert("models", "bert/1/../escape.txt", "x");
        let store = store_with(backend, dir.path());
        store.connect().await.unwrap();

        let path = store.download("bert", "1").await.unwrap();
        assert_eq!(path, dir.path().join("bert").join("1"));
        assert_eq!(std::fs::read_to_string(path.join("config.json")).unwrap(), "{}");
        assert_eq!(
            std::fs::read_to_string(path.join("onnx").join("model.onnx")).unwrap(),
            "weights"
        );
        assert!(!dir.path().join("bert").join("escape.txt").exists());
        assert!(path.join("onnx").is_dir());
    }

    #[tokio::test]
    async fn test_download_missing_version() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryObjectStore::new());
        let store = store_with(backend, dir.path());
        store.connect().await.unwrap();
        assert_eq!(store.download_outcome("ghost", "latest").await, Outcome::Ok(None));
    }

    #[tokio::test]
    async fn test_not_connected_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(Arc::new(MemoryObjectStore::new()), dir.path());
        assert_eq!(
            store.download_outcome("m", "1").await,
            Outcome::Degraded(Degraded::NotConnected)
        );
        assert!(!store.upload("m", "1", dir.path()).await);
        assert!(store.list().await.is_empty());
        assert!(!store.exists("m", "1").await);
    }

    #[tokio::test]
    async fn test_upload_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(Arc::new(MemoryObjectStore::new()), dir.path());
        store.connect().await.unwrap();
        assert!(!store.upload("m", "1", &dir.path().join("nope")).await);
    }

    #[test]
    fn test_collect_files_relative_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.txt"), "1").unwrap();
        std::fs::write(dir.path().join("a/b/deep.txt"), "2").unwrap();
        let keys: Vec<String> = collect_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|(_, k)| k)
            .collect();
        assert_eq!(keys, vec!["a/b/deep.txt".to_string(), "top.txt".to_string()]);
    }
}
