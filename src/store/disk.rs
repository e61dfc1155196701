//! Cache storage persisted on disk so entries survive worker restarts.
//!
//! Layout: `{root}/{cache}/{sha256(key)}.json` holds the metadata and
//! `{root}/{cache}/{sha256(key)}.body` the response body. The metadata file
//! is renamed into place last, so its presence marks a committed entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CacheEntry, CacheStore};
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    status: u16,
    headers: Vec<(String, String)>,
    cached_at: DateTime<Utc>,
}

/// Disk-backed cache storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    root: PathBuf,
}

impl DiskCacheStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, cache: &str) -> Result<PathBuf> {
        if cache.is_empty() || cache.contains(['/', '\\']) || cache.starts_with('.') {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid cache name {cache:?}"),
            )));
        }
        Ok(self.root.join(cache))
    }

    fn entry_paths(dir: &Path, key: &str) -> (PathBuf, PathBuf) {
        let stem = format!("{:x}", Sha256::digest(key.as_bytes()));
        (
            dir.join(format!("{stem}.json")),
            dir.join(format!("{stem}.body")),
        )
    }

    async fn read_meta(path: &Path) -> Result<Option<EntryMeta>> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes `contents` to a unique temp file beside `path`, then renames it over `path`.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp_path, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn open(&self, cache: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.cache_dir(cache)?).await?;
        Ok(())
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.cache_dir(cache)?)
            .await
            .is_ok_and(|m| m.is_dir()))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            if entry.file_type().await?.is_dir()
                && let Some(name) = name.to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, cache: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.cache_dir(cache)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, cache: &str, entry: CacheEntry) -> Result<()> {
        let dir = self.cache_dir(cache)?;
        tokio::fs::create_dir_all(&dir).await?;

        let (meta_path, body_path) = Self::entry_paths(&dir, &entry.key);
        let meta = EntryMeta {
            key: entry.key,
            status: entry.status,
            headers: entry.headers,
            cached_at: entry.cached_at,
        };

        write_atomic(&body_path, &entry.body).await?;
        write_atomic(&meta_path, &serde_json::to_vec(&meta)?).await?;
        Ok(())
    }

    async fn get(&self, cache: &str, key: &str) -> Result<Option<CacheEntry>> {
        let dir = self.cache_dir(cache)?;
        let (meta_path, body_path) = Self::entry_paths(&dir, key);

        let Some(meta) = Self::read_meta(&meta_path).await? else {
            return Ok(None);
        };
        // Hash collision or a foreign file; treat as a miss.
        if meta.key != key {
            return Ok(None);
        }
        let body = match tokio::fs::read(&body_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(CacheEntry {
            key: meta.key,
            status: meta.status,
            headers: meta.headers,
            body: body.into(),
            cached_at: meta.cached_at,
        }))
    }

    async fn entry_keys(&self, cache: &str) -> Result<Vec<String>> {
        let dir = self.cache_dir(cache)?;
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(file) = read_dir.next_entry().await? {
            let path = file.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(meta) = Self::read_meta(&path).await?
            {
                keys.push(meta.key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn entry(key: &str, body: &'static str) -> CacheEntry {
        CacheEntry::from_response(
            key,
            Response::new(200, vec![("Content-Type".into(), "audio/mpeg".into())], body),
        )
    }

    #[tokio::test]
    async fn keys_on_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path().join("absent"));
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_then_get_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path());
        store
            .put("journal-eager-v1", entry("https://a/sounds/tap.mp3", "beep"))
            .await
            .unwrap();

        let reopened = DiskCacheStore::new(dir.path());
        let got = reopened
            .get("journal-eager-v1", "https://a/sounds/tap.mp3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.status, 200);
        assert_eq!(got.body, Bytes::from_static(b"beep"));
        assert_eq!(got.headers[0].1, "audio/mpeg");
    }

    #[tokio::test]
    async fn overwrite_keeps_last_write() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path());
        store.put("c", entry("https://a/x", "one")).await.unwrap();
        store.put("c", entry("https://a/x", "two")).await.unwrap();

        let got = store.get("c", "https://a/x").await.unwrap().unwrap();
        assert_eq!(got.body, Bytes::from_static(b"two"));
        assert_eq!(store.entry_keys("c").await.unwrap(), vec!["https://a/x"]);
    }

    #[tokio::test]
    async fn keys_lists_cache_directories() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path());
        store.open("journal-lazy-v1").await.unwrap();
        store.open("journal-eager-v1").await.unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        assert_eq!(
            store.keys().await.unwrap(),
            vec!["journal-eager-v1", "journal-lazy-v1"]
        );
        assert!(store.has("journal-lazy-v1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_directory() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path());
        store.put("old", entry("https://a/x", "x")).await.unwrap();

        assert!(store.delete("old").await.unwrap());
        assert!(!store.delete("old").await.unwrap());
        assert!(store.match_any("https://a/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_like_cache_names() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path());
        assert!(store.open("../escape").await.is_err());
        assert!(store.open("").await.is_err());
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path());
        store.put("c", entry("https://a/x", "x")).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("c"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
