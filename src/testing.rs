//! Test doubles shared by the worker and registration tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::manifest::AssetManifest;
use crate::network::Network;

pub const ORIGIN: &str = "https://journal.example/";

/// A scripted network. Unknown URLs answer 404; offline mode rejects everything.
pub struct MockNetwork {
    routes: Mutex<HashMap<String, (u16, String)>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Serves every eager and lazy asset of `config` with a 200 and a body naming the URL.
    pub fn serving(config: &WorkerConfig) -> Self {
        let network = Self::new();
        let origin = config.origin_url().unwrap();
        for asset in config.assets.eager().iter().chain(config.assets.lazy()) {
            let url = origin.join(asset).unwrap();
            network.route(url.as_str(), 200, &format!("body of {url}"));
        }
        network
    }

    pub fn route(&self, url: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("offline: {url}")));
        }
        let route = self.routes.lock().unwrap().get(&url).cloned();
        Ok(match route {
            Some((status, body)) => Response::new(status, Vec::new(), body),
            None => Response::new(404, Vec::new(), "not found"),
        })
    }
}

/// A small journal app: shell, stylesheet, one sound, one background video.
pub fn journal_config(version: &str) -> WorkerConfig {
    WorkerConfig::new()
        .with_version(version)
        .with_origin(ORIGIN)
        .with_shell("/index.html")
        .with_assets(
            AssetManifest::new(
                vec![
                    "/".into(),
                    "/index.html".into(),
                    "/styles.css".into(),
                    "/sounds/tap.mp3".into(),
                ],
                vec!["/media/forest.mp4".into()],
            )
            .unwrap(),
        )
}

pub fn url(path: &str) -> String {
    reqwest::Url::parse(ORIGIN).unwrap().join(path).unwrap().to_string()
}
