//! Wiring for the long-running process: queue, sync engine, triggers and the
//! shell gateway behind one listener.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::config::Config;
use crate::queue::{SqliteQueue, TaskQueue};
use crate::shell::{self, HttpFetcher, ShellHost, ShellWorker, SqliteCacheStorage};
use crate::sync::{
  self, Backends, DrainOutcome, DrainTrigger, RestBlobStore, RestDocumentStore, SyncEngine,
  SyncHandle, SyncState,
};

pub fn open_queue(config: &Config) -> Result<Arc<SqliteQueue>> {
  Ok(Arc::new(SqliteQueue::open(&config.database_path()?)?))
}

pub fn open_cache_storage(config: &Config) -> Result<Arc<SqliteCacheStorage>> {
  Ok(Arc::new(SqliteCacheStorage::open(&config.database_path()?)?))
}

fn request_timeout(config: &Config) -> Duration {
  Duration::from_secs(config.sync.request_timeout_secs)
}

/// Backend clients, or `None` when the store URLs or the API token are
/// missing. Without them the engine stays detached and drains are skipped.
pub fn build_backends(config: &Config) -> Result<Option<Backends>> {
  let (Some(documents_url), Some(blobs_url)) = (
    config.sync.document_store_url.as_deref(),
    config.sync.blob_store_url.as_deref(),
  ) else {
    warn!("document or blob store URL not configured, sync disabled");
    return Ok(None);
  };

  let token = match Config::get_api_token() {
    Ok(token) => token,
    Err(e) => {
      warn!(error = %e, "sync disabled");
      return Ok(None);
    }
  };

  let timeout = request_timeout(config);
  Ok(Some(Backends {
    documents: Arc::new(RestDocumentStore::new(documents_url, &token, timeout)?),
    blobs: Arc::new(RestBlobStore::new(blobs_url, &token, timeout)?),
  }))
}

fn build_engine(
  config: &Config,
  queue: Arc<dyn TaskQueue>,
  online: watch::Receiver<bool>,
) -> Result<Arc<SyncEngine>> {
  let engine = Arc::new(SyncEngine::new(
    queue,
    online,
    sync::device_time_zone(config.sync.device_time_zone.as_deref()),
  ));
  if let Some(backends) = build_backends(config)? {
    engine.attach(backends);
  }
  Ok(engine)
}

/// One HEAD request against the probe URL; online when none is configured.
async fn probe_once(config: &Config) -> bool {
  let Some(probe_url) = config.sync.probe_url.as_deref() else {
    return true;
  };
  match reqwest::Client::builder()
    .timeout(Duration::from_secs(config.sync.probe_interval_secs))
    .build()
  {
    Ok(client) => client.head(probe_url).send().await.is_ok(),
    Err(e) => {
      warn!(error = %e, "connectivity probe unavailable");
      false
    }
  }
}

/// Run a single drain cycle in the foreground.
pub async fn flush_once(config: &Config) -> Result<DrainOutcome> {
  let queue = open_queue(config)?;
  let (_online_tx, online_rx) = watch::channel(probe_once(config).await);
  let engine = build_engine(config, queue, online_rx)?;
  Ok(engine.drain().await)
}

#[derive(Clone)]
struct ControlState {
  engine: Arc<SyncEngine>,
  queue: Arc<dyn TaskQueue>,
  handle: SyncHandle,
}

/// Sync control surface: manual flush, foreground signal and status.
fn control_router(engine: Arc<SyncEngine>, queue: Arc<dyn TaskQueue>, handle: SyncHandle) -> Router {
  Router::new()
    .route("/__sync/flush", post(flush))
    .route("/__sync/visible", post(visible))
    .route("/__sync/status", get(sync_status))
    .with_state(ControlState {
      engine,
      queue,
      handle,
    })
}

async fn flush(State(state): State<ControlState>) -> (StatusCode, Json<serde_json::Value>) {
  state.handle.flush_now();
  (
    StatusCode::ACCEPTED,
    Json(serde_json::json!({ "requested": "manual" })),
  )
}

async fn visible(State(state): State<ControlState>) -> (StatusCode, Json<serde_json::Value>) {
  state.handle.request(DrainTrigger::Foreground);
  (
    StatusCode::ACCEPTED,
    Json(serde_json::json!({ "requested": "foreground" })),
  )
}

async fn sync_status(
  State(state): State<ControlState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
  let pending = state
    .queue
    .count()
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
  let sync_state = match state.engine.state() {
    SyncState::Idle => "idle",
    SyncState::Draining => "draining",
  };
  Ok(Json(serde_json::json!({
    "state": sync_state,
    "pending": pending,
  })))
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
  info!("shutting down");
}

/// Start every background service and serve until interrupted.
pub async fn run(config: Config) -> Result<()> {
  let queue = open_queue(&config)?;
  let storage = open_cache_storage(&config)?;

  // Without a probe the device is assumed online.
  let (online_tx, online_rx) = watch::channel(config.sync.probe_url.is_none());
  let engine = build_engine(&config, queue.clone(), online_rx)?;

  let handle = sync::spawn_drain_loop(
    engine.clone(),
    Duration::from_secs(config.sync.periodic_interval_secs),
    Duration::from_secs(config.sync.periodic_min_gap_secs),
  );
  if let Some(probe_url) = config.sync.probe_url.clone() {
    sync::spawn_connectivity_probe(
      probe_url,
      Duration::from_secs(config.sync.probe_interval_secs),
      online_tx.clone(),
      handle.clone(),
    );
  }

  let fetcher = Arc::new(HttpFetcher::new(request_timeout(&config))?);
  let host = Arc::new(ShellHost::new(storage.clone(), fetcher.clone()));
  let worker = ShellWorker::from_config(&config.shell, storage, fetcher)?;
  {
    let host = host.clone();
    tokio::spawn(async move {
      if let Err(e) = host.register(worker).await {
        warn!(error = %e, "shell worker failed to activate");
      }
    });
  }

  let origin = Url::parse(&config.shell.origin)
    .map_err(|e| eyre!("Invalid shell origin {}: {}", config.shell.origin, e))?;
  let app = Router::new()
    .merge(control_router(engine, queue, handle))
    .merge(shell::router(host, origin));

  let listener = tokio::net::TcpListener::bind(&config.shell.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.shell.listen, e))?;
  info!(listen = %config.shell.listen, origin = %config.shell.origin, "fieldpost running");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server terminated with error: {}", e))?;

  drop(online_tx);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{StoreConfig, SyncConfig};
  use crate::queue::{NewTask, Scope};

  fn config_in(dir: &tempfile::TempDir) -> Config {
    Config {
      store: StoreConfig {
        path: Some(dir.path().join("fieldpost.db")),
      },
      ..Default::default()
    }
  }

  #[test]
  fn test_backends_need_store_urls() {
    let config = Config {
      sync: SyncConfig {
        document_store_url: None,
        ..Default::default()
      },
      ..Default::default()
    };
    assert!(build_backends(&config).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_flush_once_without_backends_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);
    let queue = open_queue(&config).unwrap();
    queue
      .enqueue(&NewTask::new(
        "incident-upload",
        "incidents/1",
        Scope {
          client: "acme".to_string(),
          unit: "north".to_string(),
        },
      ))
      .unwrap();

    let outcome = flush_once(&config).await.unwrap();
    assert_eq!(
      outcome,
      DrainOutcome::Skipped(crate::sync::SkipReason::BackendsDetached)
    );
    assert_eq!(queue.count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_sync_status_reports_pending() {
    let queue: Arc<dyn TaskQueue> = Arc::new(SqliteQueue::from_connection(
      crate::db::open_in_memory().unwrap(),
    ));
    let (_tx, rx) = watch::channel(false);
    let engine = Arc::new(SyncEngine::new(queue.clone(), rx, "UTC".to_string()));
    let handle = sync::spawn_drain_loop(
      engine.clone(),
      Duration::from_secs(3600),
      Duration::from_secs(45),
    );
    let state = ControlState {
      engine,
      queue,
      handle,
    };

    let Json(status) = sync_status(State(state.clone())).await.unwrap();
    assert_eq!(status["pending"], 0);

    let (code, _) = flush(State(state)).await;
    assert_eq!(code, StatusCode::ACCEPTED);
  }
}
