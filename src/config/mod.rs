//! Configuration types for the worker, its storage and the proxy host.

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::manifest::{AssetManifest, CacheNames, resolve};

/// Default cache name prefix.
pub const DEFAULT_CACHE_PREFIX: &str = "journal";

/// Default version tag.
pub const DEFAULT_VERSION: &str = "1";

/// Default upstream app origin.
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:3000/";

/// Default shell page served when offline.
pub const DEFAULT_SHELL: &str = "/index.html";

/// Default proxy port.
pub const DEFAULT_PORT: u16 = 8787;

/// Which failed requests receive the cached shell page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellFallback {
    /// Only navigations; asset failures propagate.
    #[default]
    Navigations,
    /// Every request whose network fetch fails.
    All,
}

/// Immutable worker configuration: version tag, cache names and manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Version tag embedded in both cache names.
    pub version: String,
    /// Prefix of both cache names.
    pub cache_prefix: String,
    /// Origin that relative manifest entries resolve against.
    pub origin: String,
    /// Shell page path or URL.
    pub shell: String,
    /// Maximum concurrent fetches while populating the eager cache.
    pub install_concurrency: usize,
    /// Shell fallback policy.
    pub fallback: ShellFallback,
    /// Eager and lazy asset lists.
    pub assets: AssetManifest,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            shell: DEFAULT_SHELL.to_string(),
            install_concurrency: 6,
            fallback: ShellFallback::default(),
            assets: AssetManifest::default(),
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the version tag.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the cache name prefix.
    #[must_use]
    pub fn with_cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    /// Sets the app origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the shell page.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Sets the asset manifest.
    #[must_use]
    pub fn with_assets(mut self, assets: AssetManifest) -> Self {
        self.assets = assets;
        self
    }

    /// Sets the install fetch concurrency.
    #[must_use]
    pub const fn with_install_concurrency(mut self, concurrency: usize) -> Self {
        self.install_concurrency = concurrency;
        self
    }

    /// Sets the shell fallback policy.
    #[must_use]
    pub const fn with_fallback(mut self, fallback: ShellFallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Cache names for the current version tag.
    #[must_use]
    pub fn cache_names(&self) -> CacheNames {
        CacheNames::new(&self.cache_prefix, &self.version)
    }

    /// Parsed app origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the origin is not an absolute URL.
    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin).map_err(|e| Error::InvalidUrl {
            url: self.origin.clone(),
            reason: e.to_string(),
        })
    }

    /// Shell page resolved against the origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the origin or shell cannot be parsed.
    pub fn shell_url(&self) -> Result<Url> {
        resolve(&self.origin_url()?, &self.shell)
    }

    /// Validates the configuration.
    ///
    /// A shell page missing from the eager list is only warned about: the
    /// offline fallback will then miss instead of failing the worker.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty version tag, an unparsable origin or
    /// shell, or a manifest violating its partition invariant.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::Manifest("version tag must not be empty".to_string()));
        }
        if self.install_concurrency == 0 {
            return Err(Error::Manifest(
                "install_concurrency must be > 0".to_string(),
            ));
        }
        self.assets.validate()?;
        let origin = self.origin_url()?;
        let shell = self.shell_url()?;
        self.assets.validate_resolved(&origin)?;
        if !self.assets.is_eager_url(&origin, &shell) {
            log::warn!(
                "Shell page {shell} is not in the eager manifest; offline fallback will miss"
            );
        }
        Ok(())
    }
}

/// Proxy host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Listening port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Cache storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Persisted under [`StorageConfig::dir`].
    #[default]
    Disk,
    /// Lost on restart.
    Memory,
}

/// Cache storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend.
    pub backend: StorageBackend,
    /// Root directory of the disk store.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            backend: StorageBackend::default(),
            dir: cache_dir.join("shellcache"),
        }
    }
}

/// Complete application configuration, read from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker configuration.
    pub worker: WorkerConfig,
    /// Proxy host configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location (`$XDG_CONFIG_HOME/shellcache/config.toml`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shellcache")
            .join("config.toml")
    }

    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env();
        config.worker.validate()?;
        Ok(config)
    }

    /// Loads configuration, writing a default template first if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be written or the file is invalid.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("Writing default config to {}", path.display());
            Self::default().save(path)?;
        }
        Self::load(path)
    }

    /// Saves the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Applies `SHELLCACHE_PORT` if set.
    fn apply_env(&mut self) {
        if let Some(port) = std::env::var("SHELLCACHE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.server.port = port;
        }
    }
}
