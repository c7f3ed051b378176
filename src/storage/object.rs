//! Object-store backend contract.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;

/// One entry of a bucket listing.
///
/// With a non-recursive listing, common prefixes come back as `is_dir` entries whose
/// key ends in `/`, the way S3 reports them.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

impl ObjectEntry {
    pub fn object(key: impl Into<String>, size: u64, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified,
            is_dir: false,
        }
    }

    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            last_modified: None,
            is_dir: true,
        }
    }

    /// Zero-length object whose key ends in `/` (a pseudo-directory created by some tools).
    pub fn is_directory_marker(&self) -> bool {
        self.is_dir || (self.size == 0 && self.key.ends_with('/'))
    }
}

/// Bucket-oriented blob store used by [`ArtifactStore`](super::ArtifactStore).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// List keys under `prefix`. Non-recursive listings fold deeper keys into
    /// `is_dir` prefix entries one level below `prefix`.
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<Vec<ObjectEntry>>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    /// Write an object to `dest`. Backends that can stream override this.
    async fn get_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let body = self.get(bucket, key).await?;
        tokio::fs::write(dest, &body).await?;
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Fold a recursive listing into one level below `prefix` (shared by in-process stores).
pub(crate) fn fold_listing(prefix: &str, objects: Vec<ObjectEntry>, recursive: bool) -> Vec<ObjectEntry> {
    if recursive {
        return objects;
    }
    let mut out: Vec<ObjectEntry> = Vec::new();
    for obj in objects {
        let rest = &obj.key[prefix.len()..];
        match rest.find('/') {
            Some(idx) if idx + 1 < rest.len() => {
                let dir = format!("{}{}", prefix, &rest[..=idx]);
                if !out.iter().any(|e| e.is_dir && e.key == dir) {
                    out.push(ObjectEntry::prefix(dir));
                }
            }
            _ => out.push(obj),
        }
    }
    out
}
