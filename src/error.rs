//! Error types for the shellcache library.

use thiserror::Error;

/// Errors that can occur while installing, activating or serving through the worker.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error from the network layer.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Network request could not be completed (offline, DNS failure, refused).
    #[error("Network error: {0}")]
    Network(String),

    /// I/O error during cache storage operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Eager cache population failed; nothing was committed.
    #[error("Install failed while caching {url}: {reason}")]
    Install {
        /// URL whose fetch aborted the install.
        url: String,
        /// Why the fetch was rejected.
        reason: String,
    },

    /// The asset manifest violates its invariants.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// A URL in the manifest or a request could not be parsed.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending input.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// Worker lifecycle operation attempted in the wrong state.
    #[error("Lifecycle error: {0}")]
    State(String),

    /// Configuration file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized.
    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Cache entry metadata or control message was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for shellcache operations.
pub type Result<T> = std::result::Result<T, Error>;
