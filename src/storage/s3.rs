//! S3/MinIO object store over HTTP (path-style addressing, SigV4).

use super::object::{ObjectEntry, ObjectStore};
use super::sigv4::{self, Credentials, SigningRequest, EMPTY_PAYLOAD_SHA256};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct S3Config {
    /// `host:port` or a full URL. A bare host uses `https` when `secure` is set.
    pub endpoint: String,
    pub access_key: String,
    /// Falls back to the OS keyring (feature `keyring`) when unset.
    pub secret_key: Option<String>,
    pub region: String,
    pub secure: bool,
    pub timeout: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: None,
            region: "us-east-1".to_string(),
            secure: false,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct S3ObjectStore {
    client: reqwest::Client,
    base: Url,
    host: String,
    creds: Credentials,
    xml: XmlPatterns,
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self> {
        let raw = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            let scheme = if config.secure { "https" } else { "http" };
            format!("{}://{}", scheme, config.endpoint)
        };
        let base = Url::parse(&raw).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid object store endpoint {:?}: {}", raw, e),
                ErrorContext::new().with_field_path("storage.endpoint"),
            )
        })?;
        let host = match (base.host_str(), base.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(Error::configuration_with_context(
                    format!("object store endpoint {:?} has no host", raw),
                    ErrorContext::new().with_field_path("storage.endpoint"),
                ))
            }
        };

        let secret_key = match config.secret_key {
            Some(secret) => secret,
            None => keyring_secret(&config.access_key).ok_or_else(|| {
                Error::configuration_with_context(
                    "object store secret key is not configured",
                    ErrorContext::new().with_field_path("storage.secret_key"),
                )
            })?,
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base,
            host,
            creds: Credentials {
                access_key: config.access_key,
                secret_key,
                region: config.region,
            },
            xml: XmlPatterns::new()?,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<reqwest::Response> {
        let payload_hash = match &body {
            Some(b) => sigv4::sha256_hex(b),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };
        let mut url = format!(
            "{}://{}{}",
            self.base.scheme(),
            self.host,
            sigv4::uri_encode(path, true)
        );
        if !query.is_empty() {
            url.push('?');
            url.push_str(&sigv4::canonical_query(query));
        }
        let url = Url::parse(&url).map_err(|e| {
            Error::invalid_argument_with_context(
                format!("cannot build request URL: {}", e),
                ErrorContext::new().with_details(path),
            )
        })?;

        let signed = sigv4::sign(
            &self.creds,
            &SigningRequest {
                method: method.as_str(),
                host: &self.host,
                path,
                query,
                headers: &[],
                payload_sha256: &payload_hash,
            },
            Utc::now(),
        )?;

        let mut req = self.client.request(method.clone(), url);
        for (name, value) in signed {
            req = req.header(name, value);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        debug!(method = %method, path = %path, "object store request");
        Ok(req.send().await?)
    }

    async fn fail(&self, path: &str, resp: reqwest::Response) -> Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let code = self.xml.leaf_elements(&body).remove("Code").unwrap_or_default();
        let context = ErrorContext::new().with_details(path).with_source("s3");
        if status == StatusCode::NOT_FOUND {
            Error::not_found_with_context(format!("{} ({})", status, code), context)
        } else {
            Error::backend_with_context(format!("object store returned {} {}", status, code), context)
        }
    }
}

#[cfg(feature = "keyring")]
fn keyring_secret(access_key: &str) -> Option<String> {
    keyring::Entry::new("ai-ml-core", access_key)
        .ok()
        .and_then(|entry| entry.get_password().ok())
}

#[cfg(not(feature = "keyring"))]
fn keyring_secret(_access_key: &str) -> Option<String> {
    None
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let path = format!("/{}", bucket);
        let resp = self.send(Method::HEAD, &path, &[], None).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.fail(&path, resp).await),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let path = format!("/{}", bucket);
        let resp = self.send(Method::PUT, &path, &[], None).await?;
        // 409 BucketAlreadyOwnedByYou: another instance created it first.
        if resp.status().is_success() || resp.status() == StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(self.fail(&path, resp).await)
        }
    }

    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<Vec<ObjectEntry>> {
        let path = format!("/{}", bucket);
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if !recursive {
                query.push(("delimiter".to_string(), "/".to_string()));
            }
            if let Some(t) = &token {
                query.push(("continuation-token".to_string(), t.clone()));
            }
            let resp = self.send(Method::GET, &path, &query, None).await?;
            if !resp.status().is_success() {
                return Err(self.fail(&path, resp).await);
            }
            let page = self.xml.list_page(&resp.text().await?);
            entries.extend(page.entries);
            match page.next_token {
                Some(next) if page.truncated => token = Some(next),
                _ => break,
            }
        }
        Ok(entries)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let path = format!("/{}/{}", bucket, key);
        let resp = self.send(Method::GET, &path, &[], None).await?;
        if !resp.status().is_success() {
            return Err(self.fail(&path, resp).await);
        }
        Ok(resp.bytes().await?)
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let path = format!("/{}/{}", bucket, key);
        let resp = self.send(Method::PUT, &path, &[], Some(body)).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.fail(&path, resp).await)
        }
    }

    async fn get_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let path = format!("/{}/{}", bucket, key);
        let resp = self.send(Method::GET, &path, &[], None).await?;
        if !resp.status().is_success() {
            return Err(self.fail(&path, resp).await);
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

struct ListPage {
    entries: Vec<ObjectEntry>,
    truncated: bool,
    next_token: Option<String>,
}

/// Compiled patterns for the flat XML documents S3 returns.
struct XmlPatterns {
    leaf: Regex,
    contents: Regex,
    prefixes: Regex,
    entity: Regex,
}

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::backend(format!("invalid listing pattern: {}", e)))
}

impl XmlPatterns {
    fn new() -> Result<Self> {
        Ok(Self {
            leaf: regex(r"<([A-Za-z]+)>([^<]*)</[A-Za-z]+>")?,
            contents: regex(r"(?s)<Contents>(.*?)</Contents>")?,
            prefixes: regex(r"(?s)<CommonPrefixes>(.*?)</CommonPrefixes>")?,
            entity: regex(r"&(#x[0-9A-Fa-f]+|#[0-9]+|lt|gt|quot|apos|amp);")?,
        })
    }

    /// Single pass, so `&amp;lt;` decodes to `&lt;` and not `<`.
    fn unescape(&self, text: &str) -> String {
        self.entity
            .replace_all(text, |cap: &regex::Captures<'_>| {
                let name = &cap[1];
                let decoded = match name {
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "amp" => Some('&'),
                    _ => {
                        let code = match name.strip_prefix("#x") {
                            Some(hex) => u32::from_str_radix(hex, 16).ok(),
                            None => name[1..].parse::<u32>().ok(),
                        };
                        code.and_then(char::from_u32)
                    }
                };
                decoded.map(String::from).unwrap_or_else(|| cap[0].to_string())
            })
            .into_owned()
    }

    /// Leaf elements (`<Name>text</Name>`) of a fragment, first occurrence wins.
    fn leaf_elements(&self, xml: &str) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for cap in self.leaf.captures_iter(xml) {
            out.entry(cap[1].to_string())
                .or_insert_with(|| self.unescape(&cap[2]));
        }
        out
    }

    fn list_page(&self, xml: &str) -> ListPage {
        let mut entries = Vec::new();
        for cap in self.contents.captures_iter(xml) {
            let fields = self.leaf_elements(&cap[1]);
            let Some(key) = fields.get("Key") else {
                continue;
            };
            let size = fields
                .get("Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            let modified = fields
                .get("LastModified")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc));
            entries.push(ObjectEntry::object(key.clone(), size, modified));
        }
        for cap in self.prefixes.captures_iter(xml) {
            if let Some(prefix) = self.leaf_elements(&cap[1]).remove("Prefix") {
                entries.push(ObjectEntry::prefix(prefix));
            }
        }

        let stripped = self
            .prefixes
            .replace_all(&self.contents.replace_all(xml, ""), "")
            .into_owned();
        let top = self.leaf_elements(&stripped);
        ListPage {
            entries,
            truncated: top.get("IsTruncated").map(|v| v == "true").unwrap_or(false),
            next_token: top.get("NextContinuationToken").cloned(),
        }
    }
}
