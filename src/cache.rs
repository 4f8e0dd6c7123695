//! Redirect-target caching for storage backends.
//!
//! WebDAV backends remember the upstream's redirect `Location` per content
//! hash so repeated downloads can short-circuit straight to a `302` without
//! another upstream round-trip. Entries carry a per-key TTL and live under
//! a namespace derived from both the upstream user and endpoint, so two
//! backends with distinct credentials can never alias each other's links.
//!
//! # Example
//!
//! ```rust,ignore
//! let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
//! let scoped = WithNamespace::new(cache, "redirect-cache@user;https://dav@");
//! scoped.set("aa…01", "https://cdn/aa…01".into(), Duration::from_secs(300));
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// String cache with per-entry expiry.
pub trait Cache: Send + Sync {
    /// Store `value` under `key` for `ttl`. A zero TTL stores nothing.
    fn set(&self, key: &str, value: String, ttl: Duration);
    /// Fetch a live value; expired entries are misses.
    fn get(&self, key: &str) -> Option<String>;
}

struct Entry {
    value: String,
    expires: Instant,
}

/// Shared in-memory cache.
///
/// Expired entries are dropped opportunistically: on read, and in a
/// bounded sweep whenever the map grows past a threshold.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

const SWEEP_THRESHOLD: usize = 4096;

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for MemoryCache {
    fn set(&self, key: &str, value: String, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.len() >= SWEEP_THRESHOLD {
            entries.retain(|_, e| e.expires > now);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires: now + ttl,
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.expires > Instant::now() => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

/// Cache that stores nothing; used when redirect caching is disabled.
pub struct NoCache;

impl Cache for NoCache {
    fn set(&self, _key: &str, _value: String, _ttl: Duration) {}

    fn get(&self, _key: &str) -> Option<String> {
        None
    }
}

/// Wrapper prefixing every key with a namespace.
pub struct WithNamespace {
    inner: Arc<dyn Cache>,
    prefix: String,
}

impl WithNamespace {
    pub fn new(inner: Arc<dyn Cache>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    /// Namespace for a storage backend's redirect links. Includes both the
    /// user and endpoint so distinct credentials never share entries.
    pub fn redirect_namespace(user: &str, endpoint: &str) -> String {
        format!("redirect-cache@{};{}@", user, endpoint)
    }
}

impl Cache for WithNamespace {
    fn set(&self, key: &str, value: String, ttl: Duration) {
        self.inner.set(&format!("{}{}", self.prefix, key), value, ttl);
    }

    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(&format!("{}{}", self.prefix, key))
    }
}
