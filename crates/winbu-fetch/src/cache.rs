//! In-memory content cache keyed by target fingerprint.
//!
//! ## Expiry
//!
//! Entries carry their own TTL. A lookup that finds an expired entry removes
//! it and reports a miss; the maintenance sweep removes the rest in bulk.
//! Deadlines use `tokio::time::Instant` so paused-clock tests can drive them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::types::{Document, Fingerprint};

struct CacheEntry {
    url: String,
    document: Arc<Document>,
    inserted_at: DateTime<Utc>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Live (unexpired) entries.
    pub count: usize,
    pub entries: Vec<CacheEntryInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryInfo {
    pub fingerprint: Fingerprint,
    pub url: String,
    pub inserted_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_whole_seconds")]
    pub expires_in: Duration,
}

/// Concurrent TTL cache of assembled documents.
#[derive(Default)]
pub struct ContentCache {
    entries: DashMap<Fingerprint, CacheEntry>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh document for `key`, if any. Expired entries are dropped here.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<Document>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                tracing::debug!("cache hit: {}", entry.url);
                return Some(Arc::clone(&entry.document));
            }
            Some(_) => true,
            None => false,
        };

        // The read guard is released before removal to avoid a shard deadlock.
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
            tracing::debug!("cache entry {key} expired");
        }
        None
    }

    /// Store `document` under `key` for `ttl`, replacing any previous entry.
    pub fn put(
        &self,
        key: Fingerprint,
        url: impl Into<String>,
        document: Arc<Document>,
        ttl: Duration,
    ) {
        let entry = CacheEntry {
            url: url.into(),
            document,
            inserted_at: Utc::now(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key, entry);
    }

    /// Remove one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry.
    pub fn flush(&self) {
        let removed = self.entries.len();
        self.entries.clear();
        tracing::info!("cache flushed: {removed} entries removed");
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut entries: Vec<CacheEntryInfo> = self
            .entries
            .iter()
            .filter(|item| !item.value().is_expired(now))
            .map(|item| CacheEntryInfo {
                fingerprint: item.key().clone(),
                url: item.value().url.clone(),
                inserted_at: item.value().inserted_at,
                expires_in: item.value().expires_at.saturating_duration_since(now),
            })
            .collect();
        entries.sort_by(|a, b| a.inserted_at.cmp(&b.inserted_at));

        CacheStats {
            count: entries.len(),
            entries,
        }
    }
}

fn serialize_whole_seconds<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let rounded = Duration::from_secs(value.as_secs());
    serializer.collect_str(&humantime::format_duration(rounded))
}
