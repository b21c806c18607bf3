//! Read-through cache for experiment definitions and sticky variant decisions.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

const KEY_NAMESPACE: &str = "abk";

#[must_use]
pub fn experiment_key(experiment: &str) -> String {
    format!("{KEY_NAMESPACE}:experiment:{experiment}")
}

#[must_use]
pub fn variant_key(experiment: &str, user_id: &str) -> String {
    format!("{KEY_NAMESPACE}:variant:{experiment}:{user_id}")
}

/// Prefix covering every per-user variant entry of one experiment.
#[must_use]
pub fn variant_prefix(experiment: &str) -> String {
    format!("{KEY_NAMESPACE}:variant:{experiment}:")
}

pub trait Cache {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn delete(&self, key: &str);
    /// Returns how many entries were removed.
    fn delete_prefix(&self, prefix: &str) -> usize;
    fn flush(&self);
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-process cache with an optional per-entry time-to-live.
#[derive(Debug, Default)]
pub struct MemoryCache {
    ttl: Option<Duration>,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.lock();
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some_and(|at| Instant::now() >= at));
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    fn set(&self, key: &str, value: Value) {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        self.lock()
            .insert(key.to_string(), CacheEntry { value, expires_at });
    }

    fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        doomed.len()
    }

    fn flush(&self) {
        self.lock().clear();
    }
}
