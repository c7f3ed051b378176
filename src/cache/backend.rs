//! Key-value backend implementations.

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Expiry-capable key-value store used by [`ResultCache`](super::ResultCache).
///
/// Values are opaque strings (the cache stores JSON documents). `scan` follows the
/// Redis cursor contract: start with cursor `0`, stop when the returned cursor is `0`.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Establish the connection and verify liveness.
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Delete `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;
    fn name(&self) -> &'static str;
}

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
    seq: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process backend with real expiry, glob scans and an outage switch.
///
/// Uses the tokio clock, so tests can pause and advance time to observe expiry.
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    next_seq: AtomicU64,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time-to-live of `key`, if present.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at - now)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::backend_with_context(
                "memory backend unavailable",
                ErrorContext::new().with_source("memory"),
            ))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn connect(&self) -> Result<()> {
        self.check_available()
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
                seq,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        let mut deleted = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if !entry.is_expired(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        self.check_available()?;
        let matcher = KeyPattern::new(pattern)?;
        let now = Instant::now();
        let entries = self.lock();
        // The cursor is an insertion sequence number, so deleting keys between pages
        // never shifts entries that have not been visited yet.
        let mut pending: Vec<(u64, &String, &Entry)> = entries
            .iter()
            .filter(|(_, e)| e.seq >= cursor)
            .map(|(k, e)| (e.seq, k, e))
            .collect();
        pending.sort_by_key(|(seq, _, _)| *seq);

        let page = count.max(1);
        let next = if pending.len() > page {
            pending[page].0
        } else {
            0
        };
        let keys = pending
            .into_iter()
            .take(page)
            .filter(|(_, k, e)| !e.is_expired(now) && matcher.matches(k))
            .map(|(_, k, _)| k.clone())
            .collect();
        Ok((next, keys))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Backend that stores nothing; every read is a miss.
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for NullBackend {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
    async fn get(&self, _: &str) -> Result<Option<String>> {
        Ok(None)
    }
    async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _: &[String]) -> Result<u64> {
        Ok(0)
    }
    async fn scan(&self, _: u64, _: &str, _: usize) -> Result<(u64, Vec<String>)> {
        Ok((0, Vec::new()))
    }
    fn name(&self) -> &'static str {
        "null"
    }
}

/// A Redis `SCAN MATCH` pattern (`*`, `?`, `[abc]`, `[a-z]`, `[^a]`, `\` escapes)
/// compiled once into a [`glob::Pattern`].
#[derive(Debug, Clone)]
pub struct KeyPattern {
    inner: glob::Pattern,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let translated = translate_redis_glob(pattern);
        let inner = glob::Pattern::new(&translated).map_err(|e| {
            Error::invalid_argument_with_context(
                format!("invalid key pattern {:?}: {}", pattern, e),
                ErrorContext::new().with_source("cache"),
            )
        })?;
        Ok(Self { inner })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.inner.matches(key)
    }
}

/// Redis glob syntax to `glob` syntax: escapes become one-char classes, `[^` becomes
/// `[!`, runs of `*` collapse, an unterminated `[` is literal.
fn translate_redis_glob(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                push_literal(&mut out, chars[i + 1]);
                i += 2;
            }
            '*' => {
                out.push('*');
                while i < chars.len() && chars[i] == '*' {
                    i += 1;
                }
            }
            '[' => match chars[i + 1..].iter().position(|c| *c == ']') {
                Some(len) if len > 0 => {
                    let body = &chars[i + 1..i + 1 + len];
                    out.push('[');
                    let body = match body.first() {
                        Some('^') => {
                            out.push('!');
                            &body[1..]
                        }
                        _ => body,
                    };
                    out.extend(body.iter().filter(|c| **c != '\\'));
                    out.push(']');
                    i += len + 2;
                }
                _ => {
                    push_literal(&mut out, '[');
                    i += 1;
                }
            },
            c => {
                push_literal(&mut out, c);
                i += 1;
            }
        }
    }
    out
}

fn push_literal(out: &mut String, c: char) {
    if matches!(c, '*' | '?' | '[' | ']') {
        out.push('[');
        out.push(c);
        out.push(']');
    } else {
        out.push(c);
    }
}
