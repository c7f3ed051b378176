//! Residency limits.

use super::manager::LoadedModelRecord;

/// Decides which resident models to unload after a successful load.
pub trait EvictionPolicy: Send + Sync {
    /// Keys of `resident` to unload. `just_loaded` must never be returned.
    fn select_victims(&self, resident: &[LoadedModelRecord], just_loaded: &str) -> Vec<String>;
    fn name(&self) -> &'static str;
}

/// Unbounded residency; models stay until explicitly unloaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn select_victims(&self, _: &[LoadedModelRecord], _: &str) -> Vec<String> {
        Vec::new()
    }
    fn name(&self) -> &'static str {
        "none"
    }
}

/// Unloads the least recently accessed models while either limit is exceeded.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsed {
    pub max_models: Option<usize>,
    pub max_bytes: Option<u64>,
}

impl LeastRecentlyUsed {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_models(mut self, n: usize) -> Self {
        self.max_models = Some(n);
        self
    }
    pub fn with_max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    fn over_limit(&self, count: usize, bytes: u64) -> bool {
        self.max_models.map_or(false, |max| count > max) || self.max_bytes.map_or(false, |max| bytes > max)
    }
}

impl EvictionPolicy for LeastRecentlyUsed {
    fn select_victims(&self, resident: &[LoadedModelRecord], just_loaded: &str) -> Vec<String> {
        let mut count = resident.len();
        let mut bytes: u64 = resident.iter().map(|r| r.size_bytes).sum();
        let mut candidates: Vec<&LoadedModelRecord> =
            resident.iter().filter(|r| r.key() != just_loaded).collect();
        candidates.sort_by_key(|r| r.last_access);

        let mut victims = Vec::new();
        for record in candidates {
            if !self.over_limit(count, bytes) {
                break;
            }
            count -= 1;
            bytes = bytes.saturating_sub(record.size_bytes);
            victims.push(record.key());
        }
        victims
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}
