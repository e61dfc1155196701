//! Registry of open page clients and the worker version controlling each.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// An open page.
#[derive(Debug, Clone, Serialize)]
pub struct Client {
    /// Client identifier.
    pub id: String,
    /// URL the page was opened at.
    pub url: String,
    /// Version tag of the worker controlling the page, if any.
    pub controller: Option<String>,
    /// When the page registered.
    pub opened_at: DateTime<Utc>,
}

/// Shared handle to the set of open page clients.
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct Clients {
    inner: Arc<RwLock<HashMap<String, Client>>>,
}

impl Clients {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a page, controlled by `controller` if a worker is active.
    pub async fn register(&self, url: &str, controller: Option<&str>) -> Client {
        let client = Client {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            controller: controller.map(ToString::to_string),
            opened_at: Utc::now(),
        };
        self.inner
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        client
    }

    /// Removes a closed page. Returns the client if it was registered.
    pub async fn close(&self, id: &str) -> Option<Client> {
        self.inner.write().await.remove(id)
    }

    /// Looks up a client.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.inner.read().await.get(id).cloned()
    }

    /// All open clients.
    pub async fn all(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.inner.read().await.values().cloned().collect();
        clients.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        clients
    }

    /// Number of open clients.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Returns `true` if no client is open.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Makes the worker with `version` the controller of every open client.
    /// Returns how many clients changed controller.
    pub async fn claim(&self, version: &str) -> usize {
        let mut clients = self.inner.write().await;
        let mut claimed = 0;
        for client in clients.values_mut() {
            if client.controller.as_deref() != Some(version) {
                client.controller = Some(version.to_string());
                claimed += 1;
            }
        }
        claimed
    }

    /// Returns `true` if any open client is controlled by a worker other than `version`.
    pub async fn controlled_by_other(&self, version: &str) -> bool {
        self.inner
            .read()
            .await
            .values()
            .any(|c| c.controller.as_deref().is_some_and(|v| v != version))
    }
}
