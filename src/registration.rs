//! Worker lifecycle: installing, waiting, activating, active, redundant.
//!
//! A [`Registration`] owns at most one worker per slot. A newly installed
//! worker waits while open pages are still controlled by the previous
//! version, unless it is told to skip waiting.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::manifest::CacheNames;
use crate::network::Network;
use crate::stats::CacheStats;
use crate::store::CacheStore;
use crate::worker::{MessageAction, OfflineWorker};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Fetching the eager assets.
    Installing,
    /// Installed, held back while older pages are open.
    Waiting,
    /// Deleting stale caches and claiming pages.
    Activating,
    /// Serving requests.
    Active,
    /// Failed to install, or replaced by a newer version.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Installing => "installing",
            Self::Waiting => "waiting",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Snapshot of one worker for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    /// Version tag the worker was built from.
    pub version: String,
    /// Slot the worker occupies.
    pub state: WorkerState,
    /// Eager and lazy cache names for this version.
    pub caches: CacheNames,
    /// Hit and miss counters since the worker started.
    pub stats: CacheStats,
}

impl WorkerStatus {
    fn of(worker: &OfflineWorker, state: WorkerState) -> Self {
        Self {
            version: worker.version().to_string(),
            state,
            caches: worker.cache_names().clone(),
            stats: worker.stats(),
        }
    }
}

/// Snapshot of the whole registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationStatus {
    /// Worker currently fetching its eager assets.
    pub installing: Option<WorkerStatus>,
    /// Installed worker waiting for older pages to close.
    pub waiting: Option<WorkerStatus>,
    /// Worker answering requests.
    pub active: Option<WorkerStatus>,
    /// Open pages and the version controlling each.
    pub clients: Vec<Client>,
    /// Every cache currently in storage.
    pub caches: Vec<String>,
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,
    activating: bool,
}

/// Sequences install, activation and fetch dispatch for successive worker versions.
pub struct Registration {
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    clients: Clients,
    slots: RwLock<Slots>,
    // Serializes install and activation.
    lifecycle: Mutex<()>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Creates an empty registration over shared storage and network.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> Self {
        Self {
            store,
            network,
            clients: Clients::new(),
            slots: RwLock::new(Slots::default()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Handle to the open pages.
    #[must_use]
    pub const fn clients(&self) -> &Clients {
        &self.clients
    }

    /// The worker currently answering fetches.
    pub async fn active(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.active.clone()
    }

    /// The installed worker waiting for old pages to close.
    pub async fn waiting(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.waiting.clone()
    }

    /// Installs a worker for `config` and activates it unless old pages block it.
    ///
    /// Registering the version that is already active or waiting is a no-op.
    /// If the eager cache for this version is already complete in storage,
    /// the install fetches are skipped.
    ///
    /// # Errors
    ///
    /// Returns the install error; the new worker is then redundant and the
    /// previously active worker keeps serving.
    pub async fn register(&self, config: WorkerConfig) -> Result<WorkerState> {
        let _guard = self.lifecycle.lock().await;

        {
            let slots = self.slots.read().await;
            if slots.active.as_ref().is_some_and(|w| w.version() == config.version) {
                log::debug!("Version {} is already active", config.version);
                return Ok(WorkerState::Active);
            }
            if slots.waiting.as_ref().is_some_and(|w| w.version() == config.version) {
                log::debug!("Version {} is already waiting", config.version);
                return Ok(WorkerState::Waiting);
            }
        }

        let worker = Arc::new(OfflineWorker::new(
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.network),
            self.clients.clone(),
        )?);
        self.slots.write().await.installing = Some(Arc::clone(&worker));

        let installed = match worker.is_installed().await {
            Ok(installed) => installed,
            Err(e) => {
                log::warn!(
                    "Could not check eager cache for version {}, reinstalling: {e}",
                    worker.version()
                );
                false
            }
        };
        let outcome = if installed {
            log::info!(
                "Eager cache for version {} already complete; skipping install fetches",
                worker.version()
            );
            Ok(())
        } else {
            worker.on_install().await
        };

        {
            let mut slots = self.slots.write().await;
            slots.installing = None;
            if let Err(e) = outcome {
                log::error!("Install of version {} failed: {e}", worker.version());
                return Err(e);
            }
            if let Some(previous) = slots.waiting.replace(worker) {
                log::info!(
                    "Waiting version {} replaced; now redundant",
                    previous.version()
                );
            }
        }

        Ok(self.promote().await?.unwrap_or(WorkerState::Active))
    }

    /// Re-registers with a reloaded configuration. A changed version tag
    /// installs a new worker; an unchanged one does nothing.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub async fn update(&self, config: WorkerConfig) -> Result<WorkerState> {
        log::info!("Checking for update (configured version {})", config.version);
        self.register(config).await
    }

    // Caller holds `lifecycle`.
    async fn promote(&self) -> Result<Option<WorkerState>> {
        let (waiting, has_active) = {
            let slots = self.slots.read().await;
            (slots.waiting.clone(), slots.active.is_some())
        };
        let Some(waiting) = waiting else {
            return Ok(None);
        };
        if has_active && self.clients.controlled_by_other(waiting.version()).await {
            log::info!(
                "Version {} installed and waiting for open pages to close",
                waiting.version()
            );
            return Ok(Some(WorkerState::Waiting));
        }
        self.activate_waiting().await.map(Some)
    }

    // Caller holds `lifecycle`.
    async fn activate_waiting(&self) -> Result<WorkerState> {
        let (worker, previous) = {
            let mut slots = self.slots.write().await;
            let Some(worker) = slots.waiting.take() else {
                return Err(Error::State("no waiting worker to activate".into()));
            };
            let previous = slots.active.replace(Arc::clone(&worker));
            slots.activating = true;
            (worker, previous)
        };

        if let Some(previous) = previous {
            previous.retire().await;
            log::info!("Version {} is now redundant", previous.version());
        }

        let result = worker.on_activate().await;
        self.slots.write().await.activating = false;
        result?;
        Ok(WorkerState::Active)
    }

    /// Activates the waiting worker immediately, claiming every open page.
    /// Without a waiting worker this only reports the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if activation cannot clean up cache storage.
    pub async fn skip_waiting(&self) -> Result<Option<WorkerState>> {
        let _guard = self.lifecycle.lock().await;
        let (has_waiting, has_active) = {
            let slots = self.slots.read().await;
            (slots.waiting.is_some(), slots.active.is_some())
        };
        if has_waiting {
            self.activate_waiting().await.map(Some)
        } else {
            Ok(has_active.then_some(WorkerState::Active))
        }
    }

    /// Delivers a page message to the waiting worker, or to the active one
    /// when nothing waits. Returns the resulting state when the message
    /// triggered a transition.
    ///
    /// # Errors
    ///
    /// Returns an error if a requested activation fails.
    pub async fn post_message(&self, payload: &serde_json::Value) -> Result<Option<WorkerState>> {
        let target = {
            let slots = self.slots.read().await;
            slots.waiting.clone().or_else(|| slots.active.clone())
        };
        let Some(target) = target else {
            log::debug!("No worker to receive message {payload}");
            return Ok(None);
        };
        match target.on_message(payload) {
            MessageAction::SkipWaiting => self.skip_waiting().await,
            MessageAction::None => Ok(None),
        }
    }

    /// Records a newly opened page, controlled by the active worker if any.
    pub async fn client_opened(&self, url: &str) -> Client {
        let controller = self.active().await.map(|w| w.version().to_string());
        let client = self.clients.register(url, controller.as_deref()).await;
        log::debug!("Client {} opened at {url}", client.id);
        client
    }

    /// Records a closed page. Closing the last page held by an old version
    /// activates the waiting worker. Returns `false` for an unknown client.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting activation fails.
    pub async fn client_closed(&self, id: &str) -> Result<bool> {
        if self.clients.close(id).await.is_none() {
            return Ok(false);
        }
        log::debug!("Client {id} closed");
        let _guard = self.lifecycle.lock().await;
        self.promote().await?;
        Ok(true)
    }

    /// Dispatches a request to the active worker, or straight to the network
    /// when no worker is active yet.
    ///
    /// # Errors
    ///
    /// Returns the worker's or the network's error.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        match self.active().await {
            Some(worker) => worker.on_fetch(request).await,
            None => {
                log::debug!("No active worker; passing {} through", request.url);
                self.network.fetch(&request).await
            }
        }
    }

    /// Current state of every slot plus open pages and stored caches.
    ///
    /// # Errors
    ///
    /// Returns an error if cache storage cannot be listed.
    pub async fn status(&self) -> Result<RegistrationStatus> {
        let (installing, waiting, active) = {
            let slots = self.slots.read().await;
            let active_state = if slots.activating {
                WorkerState::Activating
            } else {
                WorkerState::Active
            };
            (
                slots
                    .installing
                    .as_deref()
                    .map(|w| WorkerStatus::of(w, WorkerState::Installing)),
                slots
                    .waiting
                    .as_deref()
                    .map(|w| WorkerStatus::of(w, WorkerState::Waiting)),
                slots
                    .active
                    .as_deref()
                    .map(|w| WorkerStatus::of(w, active_state)),
            )
        };
        Ok(RegistrationStatus {
            installing,
            waiting,
            active,
            clients: self.clients.all().await,
            caches: self.store.keys().await?,
        })
    }

    /// Waits for every pending background cache write.
    pub async fn flush(&self) {
        let workers: Vec<Arc<OfflineWorker>> = {
            let slots = self.slots.read().await;
            [&slots.active, &slots.waiting]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        };
        for worker in workers {
            worker.flush().await;
        }
    }
}
