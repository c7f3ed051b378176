//! Cache namespaces and their default expiry.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Logical grouping of cached results. Each namespace has its own default TTL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    Translation,
    Prediction,
    Recommendation,
    Custom(String),
}

impl CacheNamespace {
    pub fn custom(name: impl Into<String>) -> Self {
        match name.into() {
            n if n == "translation" => Self::Translation,
            n if n == "prediction" => Self::Prediction,
            n if n == "recommendation" => Self::Recommendation,
            n => Self::Custom(n),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Translation => "translation",
            Self::Prediction => "prediction",
            Self::Recommendation => "recommendation",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CacheNamespace {
    fn from(s: &str) -> Self {
        Self::custom(s)
    }
}

/// Per-namespace default TTLs.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceTtls {
    pub translation: Duration,
    pub prediction: Duration,
    pub recommendation: Duration,
    /// Used by raw `set` calls without a TTL and by custom namespaces without an override.
    pub fallback: Duration,
    custom: HashMap<String, Duration>,
}

impl Default for NamespaceTtls {
    fn default() -> Self {
        Self {
            translation: Duration::from_secs(30 * 24 * 60 * 60),
            prediction: Duration::from_secs(60 * 60),
            recommendation: Duration::from_secs(6 * 60 * 60),
            fallback: Duration::from_secs(60 * 60),
            custom: HashMap::new(),
        }
    }
}

impl NamespaceTtls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_translation(mut self, ttl: Duration) -> Self {
        self.translation = ttl;
        self
    }

    pub fn with_prediction(mut self, ttl: Duration) -> Self {
        self.prediction = ttl;
        self
    }

    pub fn with_recommendation(mut self, ttl: Duration) -> Self {
        self.recommendation = ttl;
        self
    }

    pub fn with_fallback(mut self, ttl: Duration) -> Self {
        self.fallback = ttl;
        self
    }

    pub fn with_custom(mut self, namespace: impl Into<String>, ttl: Duration) -> Self {
        self.custom.insert(namespace.into(), ttl);
        self
    }

    pub fn ttl_for(&self, namespace: &CacheNamespace) -> Duration {
        match namespace {
            CacheNamespace::Translation => self.translation,
            CacheNamespace::Prediction => self.prediction,
            CacheNamespace::Recommendation => self.recommendation,
            CacheNamespace::Custom(name) => {
                self.custom.get(name).copied().unwrap_or(self.fallback)
            }
        }
    }
}
