//! The offline worker: install, activate, fetch and message handlers.
//!
//! A worker is bound to one immutable [`WorkerConfig`]. The host dispatches
//! platform events to [`OfflineWorker::on_install`],
//! [`OfflineWorker::on_activate`], [`OfflineWorker::on_fetch`] and
//! [`OfflineWorker::on_message`]; sequencing them is the job of
//! [`Registration`](crate::registration::Registration).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::Url;
use serde::Deserialize;
use tokio_util::task::TaskTracker;

use crate::clients::Clients;
use crate::config::{ShellFallback, WorkerConfig};
use crate::error::{Error, Result};
use crate::http::{Request, Response, ResponseSource, cache_key};
use crate::manifest::{CacheNames, Partition};
use crate::network::Network;
use crate::stats::{CacheStats, StatsTracker, format_bytes};
use crate::store::{CacheEntry, CacheStore};

/// Control messages a page can post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate a waiting worker without waiting for old pages to close.
    SkipWaiting,
}

/// What the host should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAction {
    /// Nothing; unknown or malformed messages land here.
    None,
    /// Activate this worker now.
    SkipWaiting,
}

/// Cache-first request interceptor with versioned eager and lazy caches.
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
    names: CacheNames,
    origin: Url,
    shell_key: String,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    clients: Clients,
    stats: Arc<StatsTracker>,
    writes: TaskTracker,
    retired: Arc<AtomicBool>,
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("version", &self.config.version)
            .field("names", &self.names)
            .field("origin", &self.origin.as_str())
            .finish_non_exhaustive()
    }
}

impl OfflineWorker {
    /// Creates a worker for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
        clients: Clients,
    ) -> Result<Self> {
        config.validate()?;
        let origin = config.origin_url()?;
        let shell_key = cache_key(&config.shell_url()?);
        Ok(Self {
            names: config.cache_names(),
            config: Arc::new(config),
            origin,
            shell_key,
            store,
            network,
            clients,
            stats: Arc::new(StatsTracker::new()),
            writes: TaskTracker::new(),
            retired: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Version tag of this worker.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// The configuration this worker was built with.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Names of the two caches this worker owns.
    #[must_use]
    pub const fn cache_names(&self) -> &CacheNames {
        &self.names
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Populates the eager cache. All-or-nothing: every eager URL must fetch
    /// with a `200` before anything is written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Install`] naming the first URL that failed, or a
    /// storage error if committing the entries fails.
    pub async fn on_install(&self) -> Result<()> {
        let urls = self.config.assets.resolve_eager(&self.origin)?;
        log::info!(
            "Installing version {}: caching {} eager assets into {}",
            self.version(),
            urls.len(),
            self.names.eager
        );

        let entries: Vec<CacheEntry> = stream::iter(urls)
            .map(|url| self.fetch_for_install(url))
            .buffered(self.config.install_concurrency)
            .try_collect()
            .await?;

        let existed = self.store.has(&self.names.eager).await?;
        self.store.open(&self.names.eager).await?;
        let total: usize = entries.iter().map(|e| e.body.len()).sum();
        let count = entries.len();
        for entry in entries {
            if let Err(e) = self.store.put(&self.names.eager, entry).await {
                if !existed {
                    let _ = self.store.delete(&self.names.eager).await;
                }
                return Err(e);
            }
        }
        self.store.open(&self.names.lazy).await?;

        log::info!(
            "Installed version {}: {count} assets ({})",
            self.version(),
            format_bytes(total as u64)
        );
        Ok(())
    }

    async fn fetch_for_install(&self, url: Url) -> Result<CacheEntry> {
        let request = Request::get(url);
        let key = request.cache_key();
        let response = self
            .network
            .fetch(&request)
            .await
            .map_err(|e| Error::Install {
                url: key.clone(),
                reason: e.to_string(),
            })?;
        if !response.is_success() {
            return Err(Error::Install {
                url: key,
                reason: format!("status {}", response.status),
            });
        }
        Ok(CacheEntry::from_response(key, response))
    }

    /// Returns `true` if the eager cache already holds every eager URL, as
    /// left behind by an earlier run with the same version tag.
    ///
    /// # Errors
    ///
    /// Returns an error if cache storage cannot be read.
    pub async fn is_installed(&self) -> Result<bool> {
        if !self.store.has(&self.names.eager).await? {
            return Ok(false);
        }
        let stored: HashSet<String> = self
            .store
            .entry_keys(&self.names.eager)
            .await?
            .into_iter()
            .collect();
        Ok(self
            .config
            .assets
            .resolve_eager(&self.origin)?
            .iter()
            .all(|url| stored.contains(&cache_key(url))))
    }

    /// Deletes every cache not named for this version, then claims all open
    /// pages. Returns the names of the deleted caches.
    ///
    /// # Errors
    ///
    /// Returns an error if cache storage cannot be listed or modified.
    pub async fn on_activate(&self) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.store.keys().await? {
            if !self.names.contains(&name) && self.store.delete(&name).await? {
                log::info!("Deleted stale cache {name}");
                deleted.push(name);
            }
        }
        self.store.open(&self.names.eager).await?;
        self.store.open(&self.names.lazy).await?;

        let claimed = self.clients.claim(self.version()).await;
        log::info!(
            "Activated version {} ({} stale caches removed, {claimed} clients claimed)",
            self.version(),
            deleted.len()
        );
        Ok(deleted)
    }

    /// Answers a request: cache first, then network, then the shell page.
    ///
    /// Successful network responses are copied into the eager or lazy cache
    /// in the background; the caller does not wait for the write.
    ///
    /// # Errors
    ///
    /// Returns the network error when the fetch fails and no shell fallback
    /// applies or the shell page is not cached.
    pub async fn on_fetch(&self, request: Request) -> Result<Response> {
        let key = request.cache_key();

        if request.method == "GET" {
            match self.store.match_any(&key).await {
                Ok(Some(entry)) => {
                    self.stats.record_hit();
                    log::debug!("Cache hit {key}");
                    return Ok(entry.to_response());
                }
                Ok(None) => {}
                Err(e) => log::warn!("Cache lookup for {key} failed: {e}"),
            }
        }

        let partition = self.config.assets.classify(&request.url);
        self.stats.record_fetch();

        match self.network.fetch(&request).await {
            Ok(response) => {
                if !response.is_success() || !request.is_cacheable() {
                    self.stats.record_uncached();
                    log::debug!("Not caching {key} (status {})", response.status);
                    return Ok(response);
                }
                self.store_in_background(partition, key, response.duplicate());
                Ok(response)
            }
            Err(e) => self.fallback(&request, e).await,
        }
    }

    fn store_in_background(&self, partition: Partition, key: String, response: Response) {
        if self.retired.load(Ordering::SeqCst) {
            log::debug!("Version {} is redundant; not caching {key}", self.version());
            return;
        }
        let cache = self.names.for_partition(partition).to_string();
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let retired = Arc::clone(&self.retired);
        self.writes.spawn(async move {
            // Retired between the check above and this task running.
            if retired.load(Ordering::SeqCst) {
                log::debug!("Dropping pending write of {key} to {cache}");
                return;
            }
            let bytes = response.len() as u64;
            match store.put(&cache, CacheEntry::from_response(key.clone(), response)).await {
                Ok(()) => {
                    stats.record_store(bytes);
                    log::debug!("Cached {key} in {cache} ({})", format_bytes(bytes));
                }
                Err(e) => log::warn!("Failed to cache {key} in {cache}: {e}"),
            }
        });
    }

    async fn fallback(&self, request: &Request, error: Error) -> Result<Response> {
        let eligible =
            request.is_navigation() || self.config.fallback == ShellFallback::All;
        if eligible {
            match self.store.match_any(&self.shell_key).await {
                Ok(Some(shell)) => {
                    self.stats.record_fallback();
                    log::info!("Network failed for {}; serving shell page", request.url);
                    return Ok(shell.to_response().with_source(ResponseSource::ShellFallback));
                }
                Ok(None) => log::warn!(
                    "Network failed for {} and shell page {} is not cached",
                    request.url,
                    self.shell_key
                ),
                Err(e) => log::warn!("Shell lookup failed: {e}"),
            }
        }
        self.stats.record_failure();
        Err(error)
    }

    /// Handles a page message. Only `{"type": "SKIP_WAITING"}` is understood.
    #[must_use]
    pub fn on_message(&self, payload: &serde_json::Value) -> MessageAction {
        match ControlMessage::deserialize(payload) {
            Ok(ControlMessage::SkipWaiting) => {
                log::info!("Version {} asked to skip waiting", self.version());
                MessageAction::SkipWaiting
            }
            Err(_) => {
                log::debug!("Ignoring message {payload}");
                MessageAction::None
            }
        }
    }

    /// Waits until every background cache write started so far has finished.
    pub async fn flush(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    /// Stops this worker from writing to its caches. Writes already in
    /// progress are awaited; queued writes that have not started are
    /// dropped. Called once a newer version takes over.
    pub async fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.flush().await;
    }

    /// Returns `true` once [`retire`](Self::retire) was called.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCacheStore;
    use crate::testing::{MockNetwork, journal_config, url};
    use serde_json::json;

    struct Harness {
        worker: OfflineWorker,
        store: Arc<MemoryCacheStore>,
        network: Arc<MockNetwork>,
    }

    fn harness(config: WorkerConfig) -> Harness {
        let store = Arc::new(MemoryCacheStore::new());
        let network = Arc::new(MockNetwork::serving(&config));
        let worker = OfflineWorker::new(
            config,
            Arc::clone(&store) as Arc<dyn CacheStore>,
            Arc::clone(&network) as Arc<dyn Network>,
            Clients::new(),
        )
        .unwrap();
        Harness {
            worker,
            store,
            network,
        }
    }

    fn get(path: &str) -> Request {
        Request::parse(&url(path)).unwrap()
    }

    fn navigate(path: &str) -> Request {
        Request::navigate(Url::parse(&url(path)).unwrap())
    }

    #[test]
    fn worker_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OfflineWorker>();
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = journal_config("1").with_origin("nope");
        let result = OfflineWorker::new(
            config,
            Arc::new(MemoryCacheStore::new()),
            Arc::new(MockNetwork::new()),
            Clients::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn install_serves_eager_assets_without_network() {
        let h = harness(journal_config("1"));
        h.worker.on_install().await.unwrap();
        h.network.reset_calls();

        for path in ["/", "/index.html", "/styles.css", "/sounds/tap.mp3"] {
            let response = h.worker.on_fetch(get(path)).await.unwrap();
            assert_eq!(response.source, ResponseSource::Cache, "{path}");
            assert_eq!(response.status, 200);
        }
        assert!(h.network.calls().is_empty());
        assert!(h.worker.is_installed().await.unwrap());
    }

    #[tokio::test]
    async fn install_is_all_or_nothing() {
        let h = harness(journal_config("1"));
        h.network.route(&url("/sounds/tap.mp3"), 500, "boom");

        let err = h.worker.on_install().await.unwrap_err();
        assert!(
            matches!(&err, Error::Install { url: u, .. } if u.ends_with("/sounds/tap.mp3")),
            "{err}"
        );
        assert!(!h.store.has("journal-eager-v1").await.unwrap());
        assert!(h.store.match_any(&url("/index.html")).await.unwrap().is_none());
        assert!(!h.worker.is_installed().await.unwrap());
    }

    #[tokio::test]
    async fn install_fails_when_offline() {
        let h = harness(journal_config("1"));
        h.network.set_offline(true);
        assert!(matches!(
            h.worker.on_install().await,
            Err(Error::Install { .. })
        ));
        assert!(h.store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lazy_asset_cached_in_lazy_cache_on_first_fetch() {
        let h = harness(journal_config("1"));
        h.worker.on_install().await.unwrap();
        let key = url("/media/forest.mp4");
        assert!(h.store.match_any(&key).await.unwrap().is_none());

        let first = h.worker.on_fetch(get("/media/forest.mp4")).await.unwrap();
        assert_eq!(first.source, ResponseSource::Network);
        h.worker.flush().await;

        assert!(h.store.get("journal-lazy-v1", &key).await.unwrap().is_some());
        assert!(h.store.get("journal-eager-v1", &key).await.unwrap().is_none());

        let second = h.worker.on_fetch(get("/media/forest.mp4")).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(h.network.call_count(&key), 1);
    }

    #[tokio::test]
    async fn unlisted_asset_goes_to_eager_cache() {
        let h = harness(journal_config("1"));
        h.network.route(&url("/js/streaks.js"), 200, "streaks");

        h.worker.on_fetch(get("/js/streaks.js")).await.unwrap();
        h.worker.flush().await;

        assert!(
            h.store
                .get("journal-eager-v1", &url("/js/streaks.js"))
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(h.worker.stats().entries_stored, 1);
    }

    #[tokio::test]
    async fn not_found_is_returned_but_not_cached() {
        let h = harness(journal_config("1"));
        let response = h.worker.on_fetch(get("/missing.png")).await.unwrap();
        assert_eq!(response.status, 404);
        h.worker.flush().await;

        assert!(h.store.match_any(&url("/missing.png")).await.unwrap().is_none());
        assert_eq!(h.worker.stats().uncached_responses, 1);
    }

    #[tokio::test]
    async fn redirect_status_is_not_cached() {
        let h = harness(journal_config("1"));
        h.network.route(&url("/old"), 301, "");
        let response = h.worker.on_fetch(get("/old")).await.unwrap();
        assert_eq!(response.status, 301);
        h.worker.flush().await;
        assert!(h.store.match_any(&url("/old")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_get_is_not_cached() {
        let h = harness(journal_config("1"));
        h.network.route(&url("/api/entries"), 200, "{}");
        let request = get("/api/entries").with_method("POST");
        assert_eq!(h.worker.on_fetch(request).await.unwrap().status, 200);
        h.worker.flush().await;
        assert!(h.store.match_any(&url("/api/entries")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_navigation_falls_back_to_shell() {
        let h = harness(journal_config("1"));
        h.worker.on_install().await.unwrap();
        h.network.set_offline(true);

        let response = h.worker.on_fetch(navigate("/quests/today")).await.unwrap();
        assert_eq!(response.source, ResponseSource::ShellFallback);
        let body = response.into_body();
        assert_eq!(body, format!("body of {}", url("/index.html")).as_bytes());
        assert_eq!(h.worker.stats().shell_fallbacks, 1);
    }

    #[tokio::test]
    async fn offline_asset_propagates_error() {
        let h = harness(journal_config("1"));
        h.worker.on_install().await.unwrap();
        h.network.set_offline(true);

        let err = h.worker.on_fetch(get("/media/forest.mp4")).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert_eq!(h.worker.stats().failures, 1);
    }

    #[tokio::test]
    async fn fallback_all_covers_assets() {
        let h = harness(journal_config("1").with_fallback(ShellFallback::All));
        h.worker.on_install().await.unwrap();
        h.network.set_offline(true);

        let response = h.worker.on_fetch(get("/media/forest.mp4")).await.unwrap();
        assert_eq!(response.source, ResponseSource::ShellFallback);
    }

    #[tokio::test]
    async fn offline_without_cached_shell_is_an_error() {
        let h = harness(journal_config("1"));
        h.network.set_offline(true);
        assert!(h.worker.on_fetch(navigate("/")).await.is_err());
    }

    #[tokio::test]
    async fn cache_hit_ignores_fragment() {
        let h = harness(journal_config("1"));
        h.worker.on_install().await.unwrap();
        h.network.reset_calls();

        let response = h.worker.on_fetch(get("/index.html#streak")).await.unwrap();
        assert_eq!(response.source, ResponseSource::Cache);
        assert!(h.network.calls().is_empty());
    }

    #[tokio::test]
    async fn activate_removes_caches_of_other_versions() {
        let store = Arc::new(MemoryCacheStore::new());
        let network = Arc::new(MockNetwork::serving(&journal_config("1")));
        let clients = Clients::new();
        let old = OfflineWorker::new(
            journal_config("1"),
            Arc::clone(&store) as Arc<dyn CacheStore>,
            Arc::clone(&network) as Arc<dyn Network>,
            clients.clone(),
        )
        .unwrap();
        old.on_install().await.unwrap();
        old.on_activate().await.unwrap();
        network.route(&url("/v1-only.js"), 200, "legacy");
        old.on_fetch(get("/v1-only.js")).await.unwrap();
        old.flush().await;

        let new = OfflineWorker::new(
            journal_config("2"),
            Arc::clone(&store) as Arc<dyn CacheStore>,
            Arc::clone(&network) as Arc<dyn Network>,
            clients.clone(),
        )
        .unwrap();
        new.on_install().await.unwrap();
        let page = clients.register(&url("/"), Some("1")).await;

        let mut deleted = new.on_activate().await.unwrap();
        deleted.sort();
        assert_eq!(deleted, vec!["journal-eager-v1", "journal-lazy-v1"]);
        assert_eq!(
            store.keys().await.unwrap().len(),
            2,
            "exactly two live caches after activation"
        );
        assert!(store.match_any(&url("/v1-only.js")).await.unwrap().is_none());
        assert_eq!(
            clients.get(&page.id).await.unwrap().controller.as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn on_message_understands_skip_waiting_only() {
        let h = harness(journal_config("1"));
        assert_eq!(
            h.worker.on_message(&json!({ "type": "SKIP_WAITING" })),
            MessageAction::SkipWaiting
        );
        assert_eq!(
            h.worker.on_message(&json!({ "type": "CLAIM" })),
            MessageAction::None
        );
        assert_eq!(h.worker.on_message(&json!("SKIP_WAITING")), MessageAction::None);
    }

    #[tokio::test]
    async fn retired_worker_serves_but_does_not_cache() {
        let h = harness(journal_config("1"));
        h.worker.retire().await;
        assert!(h.worker.is_retired());

        let response = h.worker.on_fetch(get("/media/forest.mp4")).await.unwrap();
        assert_eq!(response.status, 200);
        h.worker.flush().await;
        assert!(h.store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retire_drops_queued_background_write() {
        let h = harness(journal_config("1"));
        let key = url("/media/forest.mp4");
        // Queued but not yet polled on the single-threaded test runtime.
        h.worker.store_in_background(Partition::Lazy, key, Response::ok("video"));
        h.worker.retire().await;

        assert!(h.store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_fetches_of_same_asset_are_idempotent() {
        let h = Arc::new(harness(journal_config("1")));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = Arc::clone(&h);
                tokio::spawn(async move { h.worker.on_fetch(get("/media/forest.mp4")).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, 200);
        }
        h.worker.flush().await;

        assert_eq!(
            h.store.entry_keys("journal-lazy-v1").await.unwrap(),
            vec![url("/media/forest.mp4")]
        );
    }
}
