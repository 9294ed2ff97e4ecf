//! Versioned shell worker and the host that swaps generations.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::fetch::Fetcher;
use super::request::{CacheResult, ShellRequest};
use super::storage::CacheStorage;
use super::strategy::{self, classify, ClassifyRules, Generation, RequestClass, StrategyContext};
use crate::config::ShellConfig;

/// Metadata key recording the last activated version.
pub const ACTIVE_VERSION_KEY: &str = "active_version";
const NAVIGATION_PRELOAD_HEADER: &str = "service-worker-navigation-preload";
const INSTALL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  Waiting,
  Active,
  Redundant,
}

/// Control messages accepted by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellMessage {
  /// Promote the waiting worker now
  SkipWaiting,
  /// Delete every cache of every generation
  PurgeAll,
}

/// One version of the shell: its manifest, caches and strategies.
pub struct ShellWorker {
  manifest: Vec<Url>,
  rules: ClassifyRules,
  ctx: StrategyContext,
  navigation_preload: bool,
  auto_skip_waiting: bool,
  skip_waiting: AtomicBool,
  state: Mutex<LifecycleState>,
}

impl ShellWorker {
  pub fn new(version: &str, storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      manifest: Vec::new(),
      rules: ClassifyRules::default(),
      ctx: StrategyContext {
        storage,
        fetcher,
        generation: Generation::new(version),
        navigation_timeout: Duration::from_secs(8),
        fallback_pages: Vec::new(),
      },
      navigation_preload: false,
      auto_skip_waiting: true,
      skip_waiting: AtomicBool::new(false),
      state: Mutex::new(LifecycleState::Installing),
    }
  }

  /// Build a worker from the `shell` config section, resolving manifest and
  /// fallback paths against the configured origin.
  pub fn from_config(
    config: &ShellConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid shell origin {}: {}", config.origin, e))?;
    let resolve = |entries: &[String]| -> Result<Vec<Url>> {
      entries
        .iter()
        .map(|entry| {
          origin
            .join(entry)
            .map_err(|e| eyre!("Invalid shell path {}: {}", entry, e))
        })
        .collect()
    };

    let worker = Self::new(&config.version, storage, fetcher)
      .with_manifest(resolve(&config.manifest)?)
      .with_fallback_pages(resolve(&config.fallback_pages)?)
      .with_rules(ClassifyRules {
        bypass_hosts: config.bypass_hosts.clone(),
        image_hosts: config.image_hosts.clone(),
      })
      .with_navigation_timeout(Duration::from_secs(config.navigation_timeout_secs))
      .with_navigation_preload(config.navigation_preload);

    Ok(if config.auto_activate {
      worker
    } else {
      worker.without_auto_skip_waiting()
    })
  }

  pub fn with_manifest(mut self, manifest: Vec<Url>) -> Self {
    self.manifest = manifest;
    self
  }

  pub fn with_fallback_pages(mut self, pages: Vec<Url>) -> Self {
    self.ctx.fallback_pages = pages;
    self
  }

  pub fn with_rules(mut self, rules: ClassifyRules) -> Self {
    self.rules = rules;
    self
  }

  pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
    self.ctx.navigation_timeout = timeout;
    self
  }

  pub fn with_navigation_preload(mut self, enabled: bool) -> Self {
    self.navigation_preload = enabled;
    self
  }

  /// Stay in `Waiting` after install until explicitly promoted.
  pub fn without_auto_skip_waiting(mut self) -> Self {
    self.auto_skip_waiting = false;
    self
  }

  pub fn version(&self) -> &str {
    &self.ctx.generation.version
  }

  pub fn generation(&self) -> &Generation {
    &self.ctx.generation
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Redundant)
  }

  fn set_state(&self, state: LifecycleState) {
    if let Ok(mut current) = self.state.lock() {
      debug!(version = %self.version(), from = ?*current, to = ?state, "worker state");
      *current = state;
    }
  }

  fn wants_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::Acquire)
  }

  /// Populate the shell cache with the manifest, then move to `Waiting`.
  ///
  /// Best-effort: an entry that fails to fetch is logged and skipped.
  /// Returns how many entries were cached.
  pub async fn install(&self) -> usize {
    use futures::StreamExt;

    self.set_state(LifecycleState::Installing);
    let shell = &self.ctx.generation.shell;

    // Owned urls: register() runs inside tokio::spawn and must stay Send.
    let results: Vec<bool> = futures::stream::iter(self.manifest.clone())
      .map(|url: Url| async move {
        let request = ShellRequest::get(url.clone());
        match self.ctx.fetcher.fetch(&request).await {
          Ok(response) if response.is_success() => {
            match self.ctx.storage.put(shell, &url, &response) {
              Ok(()) => true,
              Err(e) => {
                warn!(url = %url, error = %e, "failed to cache manifest entry");
                false
              }
            }
          }
          Ok(response) => {
            warn!(url = %url, status = response.status, "manifest entry not cached");
            false
          }
          Err(e) => {
            warn!(url = %url, error = %e, "manifest entry not cached");
            false
          }
        }
      })
      .buffer_unordered(INSTALL_CONCURRENCY)
      .collect()
      .await;
    let cached = results.into_iter().filter(|stored| *stored).count();

    info!(
      version = %self.version(),
      cached,
      total = self.manifest.len(),
      "shell installed"
    );
    self.set_state(LifecycleState::Waiting);
    if self.auto_skip_waiting {
      self.skip_waiting.store(true, Ordering::Release);
    }
    cached
  }

  /// Evict every cache outside this generation and record it as active.
  ///
  /// Returns the names of the evicted caches.
  pub fn activate(&self) -> Result<Vec<String>> {
    let storage = &self.ctx.storage;
    let mut evicted = Vec::new();
    for name in storage.cache_names()? {
      if !self.ctx.generation.owns(&name) && storage.delete_cache(&name)? {
        evicted.push(name);
      }
    }
    storage.set_meta(ACTIVE_VERSION_KEY, self.version())?;

    self.set_state(LifecycleState::Active);
    info!(version = %self.version(), evicted = ?evicted, "shell activated");
    Ok(evicted)
  }

  /// Serve one intercepted request through its class strategy.
  pub async fn handle(&self, request: ShellRequest) -> Result<CacheResult> {
    let class = classify(&request, &self.rules);
    debug!(url = %request.url, ?class, "shell request");

    match class {
      RequestClass::Passthrough => {
        let response = self.ctx.fetcher.fetch(&request).await?;
        Ok(CacheResult::from_network(response))
      }
      RequestClass::Navigation => {
        let mut request = request;
        if self.navigation_preload {
          request.set_header(NAVIGATION_PRELOAD_HEADER, "true");
        }
        strategy::navigation(&self.ctx, &request).await
      }
      RequestClass::ImageOrFont => strategy::cache_first(&self.ctx, &request).await,
      RequestClass::Script => strategy::stale_while_revalidate(&self.ctx, &request).await,
      RequestClass::Other => strategy::network_first(&self.ctx, &request).await,
    }
  }
}

/// Snapshot of the host for the control surface and CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellStatus {
  pub active_version: Option<String>,
  pub waiting_version: Option<String>,
  pub caches: Vec<String>,
}

/// Owns the active and waiting workers and routes requests to the active one.
pub struct ShellHost {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  active: RwLock<Option<Arc<ShellWorker>>>,
  waiting: Mutex<Option<Arc<ShellWorker>>>,
}

impl ShellHost {
  pub fn new(storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      storage,
      fetcher,
      active: RwLock::new(None),
      waiting: Mutex::new(None),
    }
  }

  pub fn active(&self) -> Option<Arc<ShellWorker>> {
    self.active.read().ok().and_then(|a| a.clone())
  }

  fn waiting(&self) -> Option<Arc<ShellWorker>> {
    self.waiting.lock().ok().and_then(|w| w.clone())
  }

  /// Install a worker and activate it when allowed.
  ///
  /// A version already recorded as active with its shell cache present is
  /// promoted without reinstalling.
  pub async fn register(&self, worker: ShellWorker) -> Result<Arc<ShellWorker>> {
    if let Some(active) = self.active() {
      if active.version() == worker.version() {
        debug!(version = %worker.version(), "version already active");
        return Ok(active);
      }
    }

    let worker = Arc::new(worker);
    let recorded = self.storage.get_meta(ACTIVE_VERSION_KEY)?;
    let shell_present = self
      .storage
      .cache_names()?
      .contains(&worker.generation().shell);

    if recorded.as_deref() == Some(worker.version()) && shell_present {
      debug!(version = %worker.version(), "resuming recorded generation");
      worker.set_state(LifecycleState::Waiting);
      worker.skip_waiting.store(true, Ordering::Release);
    } else {
      worker.install().await;
    }

    if worker.wants_skip_waiting() || self.active().is_none() {
      self.promote(Arc::clone(&worker))?;
    } else {
      info!(version = %worker.version(), "new shell waiting");
      if let Ok(mut waiting) = self.waiting.lock() {
        if let Some(previous) = waiting.replace(Arc::clone(&worker)) {
          previous.set_state(LifecycleState::Redundant);
        }
      }
    }
    Ok(worker)
  }

  fn promote(&self, worker: Arc<ShellWorker>) -> Result<()> {
    worker.activate()?;

    let previous = {
      let mut active = self
        .active
        .write()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      active.replace(worker)
    };
    if let Some(previous) = previous {
      previous.set_state(LifecycleState::Redundant);
    }
    Ok(())
  }

  /// Promote the waiting worker. Returns false if none is waiting.
  pub fn skip_waiting(&self) -> Result<bool> {
    let worker = self
      .waiting
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .take();

    match worker {
      Some(worker) => {
        worker.skip_waiting.store(true, Ordering::Release);
        self.promote(worker)?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Delete every cache. Returns the number of entries removed.
  pub fn purge_all(&self) -> Result<usize> {
    let removed = self.storage.delete_all()?;
    info!(removed, "all shell caches purged");
    Ok(removed)
  }

  pub fn post_message(&self, message: ShellMessage) -> Result<()> {
    match message {
      ShellMessage::SkipWaiting => {
        if !self.skip_waiting()? {
          debug!("skip-waiting with no waiting worker");
        }
      }
      ShellMessage::PurgeAll => {
        self.purge_all()?;
      }
    }
    Ok(())
  }

  /// Route a request through the active worker, or straight to the network
  /// if no worker has activated yet.
  pub async fn handle(&self, request: ShellRequest) -> Result<CacheResult> {
    match self.active() {
      Some(worker) => worker.handle(request).await,
      None => {
        let response = self.fetcher.fetch(&request).await?;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  pub fn status(&self) -> Result<ShellStatus> {
    Ok(ShellStatus {
      active_version: self.active().map(|w| w.version().to_string()),
      waiting_version: self.waiting().map(|w| w.version().to_string()),
      caches: self.storage.cache_names()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::shell::request::{CacheSource, ShellResponse};
  use crate::shell::storage::SqliteCacheStorage;
  use crate::shell::strategy::tests::FakeNetwork;
  use std::sync::atomic::Ordering;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn storage() -> Arc<SqliteCacheStorage> {
    Arc::new(SqliteCacheStorage::from_connection(
      crate::db::open_in_memory().unwrap(),
    ))
  }

  fn network() -> Arc<FakeNetwork> {
    let network = Arc::new(FakeNetwork::default());
    network.serve("https://app.test/", "root");
    network.serve("https://app.test/index.html", "index");
    network.serve("https://app.test/menu.html", "menu");
    network
  }

  fn worker(version: &str, storage: Arc<SqliteCacheStorage>, network: Arc<FakeNetwork>) -> ShellWorker {
    ShellWorker::new(version, storage, network)
      .with_manifest(vec![
        url("https://app.test/"),
        url("https://app.test/index.html"),
        url("https://app.test/menu.html"),
        url("https://app.test/missing.js"),
      ])
      .with_fallback_pages(vec![url("https://app.test/menu.html")])
  }

  #[tokio::test]
  async fn test_install_is_best_effort() {
    let storage = storage();
    let w = worker("v1", storage.clone(), network());

    assert_eq!(w.install().await, 3);
    assert_eq!(w.state(), LifecycleState::Waiting);
    assert!(storage
      .get("shell-v1", &url("https://app.test/menu.html"), false)
      .unwrap()
      .is_some());
    assert!(storage
      .get("shell-v1", &url("https://app.test/missing.js"), false)
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_register_runs_on_spawned_task() {
    let storage = storage();
    let network = network();
    let host = Arc::new(ShellHost::new(storage.clone(), network.clone()));

    let spawned = {
      let host = host.clone();
      let worker = worker("v1", storage.clone(), network);
      tokio::spawn(async move { host.register(worker).await.map(|w| w.state()) })
    };
    assert_eq!(spawned.await.unwrap().unwrap(), LifecycleState::Active);
    assert_eq!(host.status().unwrap().active_version.as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_activation_evicts_previous_generation() {
    let storage = storage();
    let network = network();
    let host = ShellHost::new(storage.clone(), network.clone());

    let v1 = host
      .register(worker("v1", storage.clone(), network.clone()))
      .await
      .unwrap();
    storage
      .put(
        "runtime-v1",
        &url("https://app.test/app.js"),
        &ShellResponse::new(200, "js"),
      )
      .unwrap();
    assert_eq!(storage.cache_names().unwrap(), vec!["runtime-v1", "shell-v1"]);

    let v2 = host
      .register(worker("v2", storage.clone(), network.clone()))
      .await
      .unwrap();

    assert_eq!(v2.state(), LifecycleState::Active);
    assert_eq!(v1.state(), LifecycleState::Redundant);
    assert_eq!(storage.cache_names().unwrap(), vec!["shell-v2"]);
    assert_eq!(
      storage.get_meta(ACTIVE_VERSION_KEY).unwrap().as_deref(),
      Some("v2")
    );
  }

  #[tokio::test]
  async fn test_waiting_worker_promoted_on_skip_waiting() {
    let storage = storage();
    let network = network();
    let host = ShellHost::new(storage.clone(), network.clone());

    host
      .register(worker("v1", storage.clone(), network.clone()))
      .await
      .unwrap();
    let v2 = host
      .register(worker("v2", storage.clone(), network.clone()).without_auto_skip_waiting())
      .await
      .unwrap();

    assert_eq!(v2.state(), LifecycleState::Waiting);
    let status = host.status().unwrap();
    assert_eq!(status.active_version.as_deref(), Some("v1"));
    assert_eq!(status.waiting_version.as_deref(), Some("v2"));

    host.post_message(ShellMessage::SkipWaiting).unwrap();
    assert_eq!(v2.state(), LifecycleState::Active);
    assert_eq!(host.status().unwrap().waiting_version, None);
    assert_eq!(storage.cache_names().unwrap(), vec!["shell-v2"]);
    assert!(!host.skip_waiting().unwrap());
  }

  #[tokio::test]
  async fn test_recorded_generation_resumes_without_install() {
    let storage = storage();
    let network = network();

    let first = ShellHost::new(storage.clone(), network.clone());
    first
      .register(worker("v3", storage.clone(), network.clone()))
      .await
      .unwrap();
    let calls = network.calls.load(Ordering::SeqCst);

    let restarted = ShellHost::new(storage.clone(), network.clone());
    let w = restarted
      .register(worker("v3", storage.clone(), network.clone()))
      .await
      .unwrap();

    assert_eq!(w.state(), LifecycleState::Active);
    assert_eq!(network.calls.load(Ordering::SeqCst), calls);
  }

  #[tokio::test]
  async fn test_navigation_carries_preload_header() {
    let storage = storage();
    let network = network();
    let host = ShellHost::new(storage.clone(), network.clone());
    host
      .register(
        worker("v1", storage.clone(), network.clone()).with_navigation_preload(true),
      )
      .await
      .unwrap();

    let request = ShellRequest::get(url("https://app.test/menu.html"))
      .with_header("sec-fetch-mode", "navigate");
    let served = host.handle(request).await.unwrap();
    assert_eq!(served.source, CacheSource::Network);

    let seen = network.seen_headers.lock().unwrap();
    let last = seen.last().unwrap();
    assert!(last
      .iter()
      .any(|(n, v)| n == NAVIGATION_PRELOAD_HEADER && v == "true"));
  }

  #[tokio::test]
  async fn test_offline_navigation_served_from_shell() {
    let storage = storage();
    let network = network();
    let host = ShellHost::new(storage.clone(), network.clone());
    host
      .register(worker("v1", storage.clone(), network.clone()))
      .await
      .unwrap();

    network.offline.store(true, Ordering::SeqCst);
    let request = ShellRequest::get(url("https://app.test/checkin.html"))
      .with_header("accept", "text/html");
    let served = host.handle(request).await.unwrap();
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.body, b"menu");
  }

  #[tokio::test]
  async fn test_purge_all_empties_every_cache() {
    let storage = storage();
    let network = network();
    let host = ShellHost::new(storage.clone(), network.clone());
    host
      .register(worker("v1", storage.clone(), network.clone()))
      .await
      .unwrap();

    host.post_message(ShellMessage::PurgeAll).unwrap();
    assert!(host.status().unwrap().caches.is_empty());
  }

  #[tokio::test]
  async fn test_no_active_worker_passes_through() {
    let network = network();
    let host = ShellHost::new(storage(), network.clone());

    let served = host
      .handle(ShellRequest::get(url("https://app.test/index.html")))
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.body, b"index");
  }

  #[test]
  fn test_from_config_resolves_paths() {
    let config = ShellConfig {
      origin: "https://app.test/".to_string(),
      ..Default::default()
    };
    let w = ShellWorker::from_config(&config, storage(), network()).unwrap();
    assert_eq!(w.manifest.len(), 3);
    assert_eq!(w.manifest[2].as_str(), "https://app.test/menu.html");
    assert_eq!(w.ctx.fallback_pages[0].as_str(), "https://app.test/menu.html");
    assert!(w.rules.bypass_hosts.contains("googleapis.com"));
    assert!(w.auto_skip_waiting);
  }

  #[tokio::test]
  async fn test_manual_activation_from_config_waits() {
    let storage = storage();
    let network = network();
    let host = ShellHost::new(storage.clone(), network.clone());
    host
      .register(worker("v1", storage.clone(), network.clone()))
      .await
      .unwrap();

    let config = ShellConfig {
      version: "v2".to_string(),
      origin: "https://app.test/".to_string(),
      auto_activate: false,
      ..Default::default()
    };
    let v2 = host
      .register(ShellWorker::from_config(&config, storage.clone(), network).unwrap())
      .await
      .unwrap();
    assert_eq!(v2.state(), LifecycleState::Waiting);
    assert_eq!(host.status().unwrap().waiting_version.as_deref(), Some("v2"));

    assert!(host.skip_waiting().unwrap());
    assert_eq!(host.active().unwrap().version(), "v2");
  }
}
