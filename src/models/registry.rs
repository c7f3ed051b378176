//! Public model registry used when the artifact store has no copy.

use crate::storage::safe_relative;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[async_trait]
pub trait PublicRegistry: Send + Sync {
    /// Materialize `model_id` under `dest` and return the directory.
    async fn fetch(&self, model_id: &str, dest: &Path) -> Result<PathBuf>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
}

/// Hugging Face Hub client (`/api/models/{id}` + `/{id}/resolve/{revision}/{file}`).
pub struct HuggingFaceHub {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    revision: String,
}

impl HuggingFaceHub {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            revision: "main".to_string(),
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn list_files(&self, model_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/models/{}", self.base_url, model_id);
        let resp = self.request(&url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::not_found_with_context(
                format!("model {} not found on hub ({})", model_id, status),
                ErrorContext::new().with_details(url).with_source("hub"),
            ));
        }
        if !status.is_success() {
            return Err(Error::backend_with_context(
                format!("hub returned {} for {}", status, model_id),
                ErrorContext::new().with_source("hub"),
            ));
        }
        let info: ModelInfo = resp.json().await?;
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    async fn download_file(&self, model_id: &str, file: &str, dest: &Path) -> Result<()> {
        let url = format!("{}/{}/resolve/{}/{}", self.base_url, model_id, self.revision, file);
        let resp = self.request(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::backend_with_context(
                format!("hub returned {} for {}", resp.status(), file),
                ErrorContext::new().with_details(url).with_source("hub"),
            ));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PublicRegistry for HuggingFaceHub {
    async fn fetch(&self, model_id: &str, dest: &Path) -> Result<PathBuf> {
        if safe_relative(model_id).is_none() {
            return Err(Error::invalid_argument_with_context(
                format!("hub model id {:?} is not a relative path", model_id),
                ErrorContext::new().with_source("hub"),
            ));
        }
        if let Ok(mut entries) = tokio::fs::read_dir(dest).await {
            if entries.next_entry().await?.is_some() {
                debug!(model = %model_id, path = %dest.display(), "hub copy already cached");
                return Ok(dest.to_path_buf());
            }
        }

        let files: Vec<String> = self
            .list_files(model_id)
            .await?
            .into_iter()
            .filter(|f| {
                let ok = safe_relative(f).is_some();
                if !ok {
                    warn!(file = %f, "skipping unsafe hub file name");
                }
                ok
            })
            .collect();
        if files.is_empty() {
            return Err(Error::not_found_with_context(
                format!("model {} has no files on hub", model_id),
                ErrorContext::new().with_source("hub"),
            ));
        }

        let parent = dest.parent().unwrap_or(dest);
        tokio::fs::create_dir_all(parent).await?;
        let staging = parent.join(format!(".staging-{}", uuid::Uuid::new_v4()));
        for file in &files {
            if let Err(e) = self.download_file(model_id, file, &staging.join(file)).await {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        }
        if tokio::fs::metadata(dest).await.is_ok() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        tokio::fs::rename(&staging, dest).await?;
        info!(model = %model_id, files = files.len(), "fetched model from hub");
        Ok(dest.to_path_buf())
    }

    fn name(&self) -> &'static str {
        "huggingface"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_traversing_id_is_refused_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        // Unroutable base URL: reaching the network would fail differently.
        let hub = HuggingFaceHub::new("http://127.0.0.1:1").unwrap();
        let err = hub.fetch("../outside", &dir.path().join("m")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_token_filtering() {
        let hub = HuggingFaceHub::new("https://huggingface.co/")
            .unwrap()
            .with_token(Some(String::new()));
        assert!(hub.token.is_none());
        assert_eq!(hub.base_url, "https://huggingface.co");
    }
}
