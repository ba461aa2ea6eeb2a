// Response cache for read-only exchange endpoints

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
    pub max_entries: usize,
    pub utilization: f64,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    max_entries: usize,
    default_ttl: Duration,
    ttls: HashMap<String, Duration>,
}

impl ResponseCache {
    pub fn new(max_entries: usize, default_ttl: Duration, ttls: HashMap<String, Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            default_ttl,
            ttls,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let ttls = config
            .ttl_seconds
            .iter()
            .map(|(endpoint, secs)| (endpoint.clone(), Duration::from_secs(*secs)))
            .collect();
        Self::new(config.max_entries, Duration::from_secs(config.default_ttl_seconds), ttls)
    }

    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        self.ttls.get(endpoint).copied().unwrap_or(self.default_ttl)
    }

    /// Fresh value for `key`, dropping it if it has expired
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Endpoints with a zero TTL are never stored
    pub fn insert(&mut self, key: String, endpoint: &str, value: Value) {
        let ttl = self.ttl_for(endpoint);
        if ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + ttl;

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_one();
        }

        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let active = self.entries.values().filter(|e| e.expires_at > now).count();
        let total = self.entries.len();
        CacheStats {
            total_entries: total,
            active_entries: active,
            expired_entries: total - active,
            max_entries: self.max_entries,
            utilization: total as f64 / self.max_entries as f64,
        }
    }

    // Expired entries go first; otherwise the one closest to expiry
    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}
