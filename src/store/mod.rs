//! Named cache storage: the persistent request → response map the worker owns.

mod disk;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::http::{Response, ResponseSource};

pub use disk::DiskCacheStore;

/// A stored response keyed by full request URL.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL without fragment.
    pub key: String,
    /// Response status.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
    /// When the entry was written.
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Consumes a response copy into an entry stored under `key`.
    #[must_use]
    pub fn from_response(key: impl Into<String>, response: Response) -> Self {
        let status = response.status;
        let headers = response.headers.clone();
        Self {
            key: key.into(),
            status,
            headers,
            body: response.into_body(),
            cached_at: Utc::now(),
        }
    }

    /// Builds a fresh response from the stored copy.
    #[must_use]
    pub fn to_response(&self) -> Response {
        Response::new(self.status, self.headers.clone(), self.body.clone())
            .with_source(ResponseSource::Cache)
    }
}

/// Abstraction over cache storage so the worker can run against memory or disk.
///
/// Writes to the same key are serialized by the implementation; the last
/// write wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Opens a cache, creating it if it does not exist.
    async fn open(&self, cache: &str) -> Result<()>;

    /// Checks whether a cache exists.
    async fn has(&self, cache: &str) -> Result<bool>;

    /// Names of all existing caches.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Deletes a cache and every entry in it. Returns `false` if it did not exist.
    async fn delete(&self, cache: &str) -> Result<bool>;

    /// Stores an entry, creating the cache if needed.
    async fn put(&self, cache: &str, entry: CacheEntry) -> Result<()>;

    /// Looks up an entry in one cache.
    async fn get(&self, cache: &str, key: &str) -> Result<Option<CacheEntry>>;

    /// Request keys stored in one cache.
    async fn entry_keys(&self, cache: &str) -> Result<Vec<String>>;

    /// Looks up an entry across every cache, in [`keys`](Self::keys) order.
    async fn match_any(&self, key: &str) -> Result<Option<CacheEntry>> {
        for cache in self.keys().await? {
            if let Some(entry) = self.get(&cache, key).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

/// In-memory cache storage. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    // Vec keeps creation order for `keys`.
    caches: RwLock<Vec<(String, HashMap<String, CacheEntry>)>>,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, cache: &str) -> Result<()> {
        let mut caches = self.caches.write().await;
        if !caches.iter().any(|(name, _)| name == cache) {
            caches.push((cache.to_string(), HashMap::new()));
        }
        Ok(())
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        Ok(self.caches.read().await.iter().any(|(name, _)| name == cache))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .caches
            .read()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn delete(&self, cache: &str) -> Result<bool> {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|(name, _)| name != cache);
        Ok(caches.len() != before)
    }

    async fn put(&self, cache: &str, entry: CacheEntry) -> Result<()> {
        let mut caches = self.caches.write().await;
        if let Some((_, entries)) = caches.iter_mut().find(|(name, _)| name == cache) {
            entries.insert(entry.key.clone(), entry);
        } else {
            let mut entries = HashMap::new();
            entries.insert(entry.key.clone(), entry);
            caches.push((cache.to_string(), entries));
        }
        Ok(())
    }

    async fn get(&self, cache: &str, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .caches
            .read()
            .await
            .iter()
            .find(|(name, _)| name == cache)
            .and_then(|(_, entries)| entries.get(key).cloned()))
    }

    async fn entry_keys(&self, cache: &str) -> Result<Vec<String>> {
        let caches = self.caches.read().await;
        let mut keys: Vec<String> = caches
            .iter()
            .find(|(name, _)| name == cache)
            .map(|(_, entries)| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}
