//! In-process object store.

use super::object::{fold_listing, ObjectEntry, ObjectStore};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Clone)]
struct StoredObject {
    body: Bytes,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    failing_puts: HashSet<String>,
}

/// Object store held in memory, with switches for simulating outages and per-key
/// upload failures.
pub struct MemoryObjectStore {
    state: Mutex<State>,
    available: AtomicBool,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every `put` of `key` fail until cleared.
    pub fn fail_put(&self, key: impl Into<String>) {
        self.lock().failing_puts.insert(key.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_puts.clear();
    }

    /// Seed an object directly, creating the bucket if needed.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.lock().buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                body: body.into(),
                modified: Utc::now(),
            },
        );
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.lock().buckets.get(bucket).map(|b| b.len()).unwrap_or(0)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::backend_with_context(
                "object store unavailable",
                ErrorContext::new().with_source("memory_object_store"),
            ))
        }
    }

    fn no_such_bucket(bucket: &str) -> Error {
        Error::not_found_with_context(
            format!("bucket {} does not exist", bucket),
            ErrorContext::new().with_details(bucket),
        )
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.lock().buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.check_available()?;
        self.lock().buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<Vec<ObjectEntry>> {
        self.check_available()?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let objects = state.buckets.get(bucket).ok_or_else(|| Self::no_such_bucket(bucket))?;
        let matching = objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectEntry::object(k.clone(), o.body.len() as u64, Some(o.modified)))
            .collect();
        Ok(fold_listing(prefix, matching, recursive))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.check_available()?;
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let objects = state.buckets.get(bucket).ok_or_else(|| Self::no_such_bucket(bucket))?;
        objects.get(key).map(|o| o.body.clone()).ok_or_else(|| {
            Error::not_found_with_context(
                format!("object {} not found", key),
                ErrorContext::new().with_details(key),
            )
        })
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        if state.failing_puts.contains(key) {
            return Err(Error::backend_with_context(
                format!("injected upload failure for {}", key),
                ErrorContext::new().with_source("memory_object_store"),
            ));
        }
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::no_such_bucket(bucket))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
