//! shellcache - An offline-first asset cache for installable web apps.
//!
//! A worker intercepts every request a page makes. App shell, icons and
//! sounds are fetched into a versioned *eager* cache at install time; large
//! media goes into a *lazy* cache the first time it is fetched successfully.
//! When the network is unreachable, navigations are answered with the cached
//! shell page. Changing the version tag rolls both caches over.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shellcache::{HttpNetwork, MemoryCacheStore, Registration, Request, WorkerConfig};
//!
//! # async fn example() -> shellcache::Result<()> {
//! let registration = Registration::new(
//!     Arc::new(MemoryCacheStore::new()),
//!     Arc::new(HttpNetwork::with_defaults()?),
//! );
//!
//! // Install and activate version 1 of the default manifest
//! registration
//!     .register(WorkerConfig::new().with_origin("https://journal.example/"))
//!     .await?;
//!
//! // Served from the eager cache from now on, online or not
//! let response = registration
//!     .fetch(Request::parse("https://journal.example/styles.css")?)
//!     .await?;
//! println!("{} bytes from {:?}", response.len(), response.source);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod clients;
pub mod config;
pub mod error;
pub mod http;
pub mod manifest;
pub mod network;
pub mod registration;
pub mod stats;
pub mod store;
pub mod worker;

#[cfg(feature = "server")]
pub mod server;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use clients::{Client, Clients};
pub use config::{AppConfig, ShellFallback, WorkerConfig};
pub use error::{Error, Result};
pub use http::{Request, RequestMode, Response, ResponseSource};
pub use manifest::{AssetManifest, CacheNames, Partition};
pub use network::{HttpNetwork, Network};
pub use registration::{Registration, RegistrationStatus, WorkerState};
pub use stats::CacheStats;
pub use store::{CacheEntry, CacheStore, DiskCacheStore, MemoryCacheStore};
pub use worker::{ControlMessage, MessageAction, OfflineWorker};
