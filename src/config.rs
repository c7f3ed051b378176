//! 配置模块：默认值、YAML 文件与环境变量三层合并。
//!
//! Settings are resolved in three layers: built-in defaults, an optional YAML file, then
//! environment variables (after loading `.env`). Variable names are matched
//! case-insensitively.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `ENVIRONMENT` | `environment` |
//! | `SERVICE_NAME` | `service_name` |
//! | `LOG_LEVEL` | `log_level` |
//! | `STRICT_STARTUP` | `strict_startup` |
//! | `REDIS_URL` | `cache.redis_url` |
//! | `REDIS_CACHE_TTL_SECONDS` | `cache.default_ttl_secs` |
//! | `TRANSLATION_CACHE_TTL` / `PREDICTION_CACHE_TTL` / `RECOMMENDATION_CACHE_TTL` | per-namespace TTLs |
//! | `MINIO_ENDPOINT` / `MINIO_ACCESS_KEY` / `MINIO_SECRET_KEY` / `MINIO_BUCKET` / `MINIO_SECURE` / `MINIO_REGION` | `storage.*` |
//! | `STORAGE_BACKEND` / `STORAGE_ROOT` | `storage.backend`, `storage.root` |
//! | `MODEL_CACHE_DIR` / `ENABLE_GPU` / `HUB_URL` / `HUB_TOKEN` | `models.*` |
//! | `MODEL_CACHE_SIZE_GB` / `MAX_RESIDENT_MODELS` | eviction limits |
//! | `WARMUP_MODELS` | `models.warmup` as `name:type,name:type` |
//! | `EVENTS_ENDPOINT` / `KAFKA_TOPIC_PREFIX` | `events.*` |

use crate::cache::{NamespaceTtls, ResultCacheConfig};
use crate::models::ModelKind;
use crate::storage::{ArtifactStoreConfig, S3Config};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub environment: String,
    pub service_name: String,
    pub log_level: String,
    /// Overrides the production-implies-strict default.
    pub strict_startup: Option<bool>,
    pub cache: CacheSettings,
    pub storage: StorageSettings,
    pub models: ModelSettings,
    pub events: EventSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub redis_url: String,
    pub default_ttl_secs: u64,
    pub translation_ttl_secs: u64,
    pub prediction_ttl_secs: u64,
    pub recommendation_ttl_secs: u64,
    pub scan_page_size: usize,
    pub hash_width: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub endpoint: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub bucket: String,
    pub secure: bool,
    pub region: String,
    /// Root directory for the filesystem backend.
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupModel {
    pub name: String,
    pub kind: ModelKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub cache_dir: PathBuf,
    pub enable_gpu: bool,
    pub hub_url: String,
    #[serde(skip_serializing)]
    pub hub_token: Option<String>,
    pub warmup: Vec<WarmupModel>,
    pub max_resident_models: Option<usize>,
    pub max_resident_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// HTTP endpoint for envelopes; events are only logged when unset.
    pub endpoint: Option<String>,
    pub topic_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            service_name: "ai-ml-service".to_string(),
            log_level: "info".to_string(),
            strict_startup: None,
            cache: CacheSettings::default(),
            storage: StorageSettings::default(),
            models: ModelSettings::default(),
            events: EventSettings::default(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            default_ttl_secs: 3_600,
            translation_ttl_secs: 2_592_000,
            prediction_ttl_secs: 3_600,
            recommendation_ttl_secs: 21_600,
            scan_page_size: 100,
            hash_width: crate::cache::DEFAULT_HASH_WIDTH,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            endpoint: "localhost:9000".to_string(),
            access_key: "nexus".to_string(),
            secret_key: None,
            bucket: "nexus-ai-models".to_string(),
            secure: false,
            region: "us-east-1".to_string(),
            root: PathBuf::from("/var/lib/ai-ml/objects"),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/models"),
            enable_gpu: false,
            hub_url: "https://huggingface.co".to_string(),
            hub_token: None,
            warmup: Vec::new(),
            max_resident_models: None,
            max_resident_bytes: None,
        }
    }
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            topic_prefix: "ai".to_string(),
        }
    }
}

fn config_error(var: &str, msg: impl Into<String>) -> Error {
    Error::configuration_with_context(
        msg,
        ErrorContext::new().with_field_path(var).with_source("settings"),
    )
}

fn parse_bool(var: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(config_error(var, format!("expected a boolean, got {:?}", other))),
    }
}

fn parse_num<T: FromStr>(var: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| config_error(var, format!("expected a number, got {:?}", raw)))
}

/// `name:type,name:type`; an entry without `:type` loads as generic.
pub fn parse_warmup_list(raw: &str) -> Vec<WarmupModel> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.rsplit_once(':') {
            Some((name, kind)) => WarmupModel {
                name: name.trim().to_string(),
                kind: ModelKind::parse(kind),
            },
            None => WarmupModel {
                name: entry.to_string(),
                kind: ModelKind::Generic,
            },
        })
        .collect()
}

impl Settings {
    /// Defaults overridden by the process environment (after `.env`).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::default().with_env_overrides()
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid settings file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("settings"),
            )
        })
    }

    /// Optional YAML file, then `.env`, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let base = match file {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        base.with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        self.with_overrides(&vars)
    }

    /// Apply overrides from an upper-cased variable map.
    pub fn with_overrides(mut self, vars: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| vars.get(name).map(String::as_str);

        if let Some(v) = get("ENVIRONMENT") {
            self.environment = v.to_string();
        }
        if let Some(v) = get("SERVICE_NAME") {
            self.service_name = v.to_string();
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v.to_string();
        }
        if let Some(v) = get("STRICT_STARTUP") {
            self.strict_startup = Some(parse_bool("STRICT_STARTUP", v)?);
        }

        if let Some(v) = get("REDIS_URL") {
            self.cache.redis_url = v.to_string();
        }
        if let Some(v) = get("REDIS_CACHE_TTL_SECONDS") {
            self.cache.default_ttl_secs = parse_num("REDIS_CACHE_TTL_SECONDS", v)?;
        }
        if let Some(v) = get("TRANSLATION_CACHE_TTL") {
            self.cache.translation_ttl_secs = parse_num("TRANSLATION_CACHE_TTL", v)?;
        }
        if let Some(v) = get("PREDICTION_CACHE_TTL") {
            self.cache.prediction_ttl_secs = parse_num("PREDICTION_CACHE_TTL", v)?;
        }
        if let Some(v) = get("RECOMMENDATION_CACHE_TTL") {
            self.cache.recommendation_ttl_secs = parse_num("RECOMMENDATION_CACHE_TTL", v)?;
        }

        if let Some(v) = get("STORAGE_BACKEND") {
            self.storage.backend = match v.trim().to_ascii_lowercase().as_str() {
                "s3" | "minio" => StorageBackend::S3,
                "fs" | "filesystem" => StorageBackend::Filesystem,
                other => {
                    return Err(config_error(
                        "STORAGE_BACKEND",
                        format!("unknown storage backend {:?}", other),
                    ))
                }
            };
        }
        if let Some(v) = get("STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = get("MINIO_ENDPOINT") {
            self.storage.endpoint = v.to_string();
        }
        if let Some(v) = get("MINIO_ACCESS_KEY") {
            self.storage.access_key = v.to_string();
        }
        if let Some(v) = get("MINIO_SECRET_KEY") {
            self.storage.secret_key = Some(v.to_string());
        }
        if let Some(v) = get("MINIO_BUCKET") {
            self.storage.bucket = v.to_string();
        }
        if let Some(v) = get("MINIO_SECURE") {
            self.storage.secure = parse_bool("MINIO_SECURE", v)?;
        }
        if let Some(v) = get("MINIO_REGION") {
            self.storage.region = v.to_string();
        }

        if let Some(v) = get("MODEL_CACHE_DIR") {
            self.models.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ENABLE_GPU") {
            self.models.enable_gpu = parse_bool("ENABLE_GPU", v)?;
        }
        if let Some(v) = get("HUB_URL") {
            self.models.hub_url = v.to_string();
        }
        if let Some(v) = get("HUB_TOKEN") {
            self.models.hub_token = Some(v.to_string());
        }
        if let Some(v) = get("WARMUP_MODELS") {
            self.models.warmup = parse_warmup_list(v);
        }
        if let Some(v) = get("MODEL_CACHE_SIZE_GB") {
            let gb: u64 = parse_num("MODEL_CACHE_SIZE_GB", v)?;
            let bytes = gb
                .checked_mul(1024 * 1024 * 1024)
                .ok_or_else(|| config_error("MODEL_CACHE_SIZE_GB", format!("{} GB is out of range", gb)))?;
            self.models.max_resident_bytes = Some(bytes);
        }
        if let Some(v) = get("MAX_RESIDENT_MODELS") {
            self.models.max_resident_models = Some(parse_num("MAX_RESIDENT_MODELS", v)?);
        }

        if let Some(v) = get("EVENTS_ENDPOINT") {
            self.events.endpoint = Some(v.to_string()).filter(|s| !s.is_empty());
        }
        if let Some(v) = get("KAFKA_TOPIC_PREFIX") {
            self.events.topic_prefix = v.to_string();
        }
        Ok(self)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Whether connection failures at startup are fatal.
    pub fn strict_startup(&self) -> bool {
        self.strict_startup.unwrap_or_else(|| self.is_production())
    }

    pub fn namespace_ttls(&self) -> NamespaceTtls {
        NamespaceTtls::default()
            .with_translation(Duration::from_secs(self.cache.translation_ttl_secs))
            .with_prediction(Duration::from_secs(self.cache.prediction_ttl_secs))
            .with_recommendation(Duration::from_secs(self.cache.recommendation_ttl_secs))
            .with_fallback(Duration::from_secs(self.cache.default_ttl_secs))
    }

    pub fn result_cache_config(&self) -> ResultCacheConfig {
        let mut config = ResultCacheConfig::new()
            .with_service_name(self.service_name.clone())
            .with_ttls(self.namespace_ttls())
            .with_strict(self.strict_startup())
            .with_scan_page_size(self.cache.scan_page_size);
        config.hash_width = self.cache.hash_width;
        config
    }

    pub fn artifact_store_config(&self) -> ArtifactStoreConfig {
        ArtifactStoreConfig {
            bucket: self.storage.bucket.clone(),
            cache_dir: self.models.cache_dir.clone(),
            strict: self.strict_startup(),
        }
    }

    pub fn s3_config(&self) -> S3Config {
        S3Config {
            endpoint: self.storage.endpoint.clone(),
            access_key: self.storage.access_key.clone(),
            secret_key: self.storage.secret_key.clone(),
            region: self.storage.region.clone(),
            secure: self.storage.secure,
            ..S3Config::default()
        }
    }

    pub fn warmup_models(&self) -> Vec<(String, ModelKind)> {
        self.models
            .warmup
            .iter()
            .map(|w| (w.name.clone(), w.kind))
            .collect()
    }
}
