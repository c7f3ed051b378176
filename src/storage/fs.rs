//! Filesystem object store: each bucket is a directory under a root.

use super::object::{fold_listing, ObjectEntry, ObjectStore};
use crate::{Error, ErrorContext, Result};
use async_recursion::async_recursion;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        let dir = self.root.join(checked_relative(bucket)?);
        Ok(dir)
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        Ok(self.bucket_dir(bucket)?.join(checked_relative(key)?))
    }
}

/// Reject keys that would escape the bucket directory.
fn checked_relative(key: &str) -> Result<PathBuf> {
    let path = Path::new(key);
    let safe = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path.to_path_buf())
    } else {
        Err(Error::invalid_argument_with_context(
            format!("object key {:?} is not a relative path", key),
            ErrorContext::new().with_source("fs_object_store"),
        ))
    }
}

#[async_recursion]
async fn walk(base: &Path, dir: &Path, out: &mut Vec<ObjectEntry>) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let meta = entry.metadata().await?;
        if meta.is_dir() {
            walk(base, &path, out).await?;
            continue;
        }
        let Ok(rel) = path.strip_prefix(base) else {
            continue;
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        out.push(ObjectEntry::object(key, meta.len(), modified));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.bucket_dir(bucket)?)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.bucket_dir(bucket)?).await?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<Vec<ObjectEntry>> {
        let base = self.bucket_dir(bucket)?;
        if !self.bucket_exists(bucket).await? {
            return Err(Error::not_found_with_context(
                format!("bucket {} does not exist", bucket),
                ErrorContext::new().with_details(base.display().to_string()),
            ));
        }
        let mut all = Vec::new();
        walk(&base, &base, &mut all).await?;
        let mut matching: Vec<ObjectEntry> =
            all.into_iter().filter(|o| o.key.starts_with(prefix)).collect();
        matching.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(fold_listing(prefix, matching, recursive))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found_with_context(
                format!("object {} not found", key),
                ErrorContext::new().with_details(path.display().to_string()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        if !self.bucket_exists(bucket).await? {
            return Err(Error::not_found(format!("bucket {} does not exist", bucket)));
        }
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &body).await?;
        Ok(())
    }

    async fn get_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let src = self.object_path(bucket, key)?;
        tokio::fs::copy(&src, dest).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}
