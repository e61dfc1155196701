//! Asset manifest, eager/lazy partitioning and versioned cache names.

use std::collections::HashSet;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::cache_key;

/// App shell, icons and sound effects, fetched at install time.
pub const DEFAULT_EAGER_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/styles.css",
    "/app.js",
    "/manifest.json",
    "/icons/icon-192.png",
    "/icons/icon-512.png",
    "/sounds/quest-complete.mp3",
    "/sounds/level-up.mp3",
    "/sounds/tap.mp3",
    "https://cdn.jsdelivr.net/npm/canvas-confetti@1.9.3/dist/confetti.browser.min.js",
];

/// Large background media, cached on first use.
pub const DEFAULT_LAZY_ASSETS: &[&str] = &[
    "/media/backgrounds/forest.mp4",
    "/media/backgrounds/ocean.mp4",
    "/media/backgrounds/night-sky.webm",
];

/// Which cache an asset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Populated at install.
    Eager,
    /// Populated on first successful fetch.
    Lazy,
}

/// Ordered eager and lazy asset lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    #[serde(default)]
    eager: Vec<String>,
    #[serde(default)]
    lazy: Vec<String>,
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self {
            eager: DEFAULT_EAGER_ASSETS.iter().map(ToString::to_string).collect(),
            lazy: DEFAULT_LAZY_ASSETS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl AssetManifest {
    /// Builds a manifest, rejecting assets listed in both partitions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] if an entry is empty or appears in both lists.
    pub fn new(eager: Vec<String>, lazy: Vec<String>) -> Result<Self> {
        let manifest = Self { eager, lazy };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks the partition invariant. Deserialized manifests must be validated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if let Some(empty) = self.eager.iter().chain(&self.lazy).find(|a| a.trim().is_empty()) {
            return Err(Error::Manifest(format!("empty asset entry {empty:?}")));
        }
        let eager: HashSet<&str> = self.eager.iter().map(String::as_str).collect();
        if let Some(dup) = self.lazy.iter().find(|a| eager.contains(a.as_str())) {
            return Err(Error::Manifest(format!(
                "{dup} is listed as both eager and lazy"
            )));
        }
        Ok(())
    }

    /// Eager entries as written in the manifest.
    #[must_use]
    pub fn eager(&self) -> &[String] {
        &self.eager
    }

    /// Lazy entries as written in the manifest.
    #[must_use]
    pub fn lazy(&self) -> &[String] {
        &self.lazy
    }

    /// Classifies a request URL by suffix match against the lazy list.
    ///
    /// Query and fragment are ignored. Files sharing a name across
    /// directories can collide; the curated manifest avoids that.
    #[must_use]
    pub fn classify(&self, url: &Url) -> Partition {
        let mut bare = url.clone();
        bare.set_query(None);
        bare.set_fragment(None);
        let bare = bare.as_str();

        if self
            .lazy
            .iter()
            .any(|asset| bare.ends_with(asset.trim_start_matches("./")))
        {
            Partition::Lazy
        } else {
            Partition::Eager
        }
    }

    /// Resolves eager entries against the app origin, in manifest order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if an entry cannot be joined onto `origin`.
    pub fn resolve_eager(&self, origin: &Url) -> Result<Vec<Url>> {
        self.eager.iter().map(|a| resolve(origin, a)).collect()
    }

    /// Checks the partition invariant on resolved URLs, so `/media/a.mp4`,
    /// `media/a.mp4`, `./media/a.mp4` and the absolute URL count as one asset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] if a lazy entry resolves to an eager asset,
    /// or [`Error::InvalidUrl`] if an entry cannot be resolved.
    pub fn validate_resolved(&self, origin: &Url) -> Result<()> {
        let eager: HashSet<String> = self
            .resolve_eager(origin)?
            .iter()
            .map(cache_key)
            .collect();
        for asset in &self.lazy {
            let url = resolve(origin, asset)?;
            if eager.contains(&cache_key(&url)) {
                return Err(Error::Manifest(format!(
                    "{asset} resolves to eager asset {url}"
                )));
            }
        }
        Ok(())
    }

    /// Returns `true` if `url` is one of the eager entries once resolved.
    #[must_use]
    pub fn is_eager_url(&self, origin: &Url, url: &Url) -> bool {
        self.eager
            .iter()
            .filter_map(|a| resolve(origin, a).ok())
            .any(|u| u == *url)
    }
}

/// Joins a manifest entry (relative path or absolute URL) onto `origin`.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if the join fails.
pub fn resolve(origin: &Url, asset: &str) -> Result<Url> {
    origin.join(asset).map_err(|e| Error::InvalidUrl {
        url: asset.to_string(),
        reason: e.to_string(),
    })
}

/// The two cache names derived from one version tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheNames {
    /// Name of the eager cache.
    pub eager: String,
    /// Name of the lazy cache.
    pub lazy: String,
}

impl CacheNames {
    /// Derives `{prefix}-eager-v{version}` and `{prefix}-lazy-v{version}`.
    #[must_use]
    pub fn new(prefix: &str, version: &str) -> Self {
        Self {
            eager: format!("{prefix}-eager-v{version}"),
            lazy: format!("{prefix}-lazy-v{version}"),
        }
    }

    /// Cache name for a partition.
    #[must_use]
    pub fn for_partition(&self, partition: Partition) -> &str {
        match partition {
            Partition::Eager => &self.eager,
            Partition::Lazy => &self.lazy,
        }
    }

    /// Returns `true` if `name` is one of the current caches.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.eager == name || self.lazy == name
    }
}
