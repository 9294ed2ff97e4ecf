//! Drain cycle: upload embedded payloads and patch their records.

use chrono::{Local, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::payload::DecodedPayload;
use super::remote::{BlobStore, DocumentStore, RecordPatch};
use crate::queue::{Scope, Task, TaskQueue};

/// Remote clients the engine needs before it can drain anything.
#[derive(Clone)]
pub struct Backends {
  pub documents: Arc<dyn DocumentStore>,
  pub blobs: Arc<dyn BlobStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Draining,
}

/// Why a drain exited without touching the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  AlreadyDraining,
  Offline,
  BackendsDetached,
  QueueUnavailable,
}

/// Counters for one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Tasks fully uploaded, patched and removed
  pub processed: usize,
  /// Malformed tasks removed without any network call
  pub discarded: usize,
  /// Tasks left in the queue for the next cycle
  pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(DrainReport),
  Skipped(SkipReason),
}

/// Holds the draining flag for the lifetime of one cycle.
///
/// Dropping the guard returns the engine to idle, whichever way the cycle
/// ends (including a panic inside a backend call).
struct DrainGuard<'a> {
  flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self { flag })
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}

/// Drains the task queue into the remote stores.
pub struct SyncEngine {
  queue: Arc<dyn TaskQueue>,
  backends: OnceLock<Backends>,
  online: watch::Receiver<bool>,
  draining: AtomicBool,
  last_finished: Mutex<Option<Instant>>,
  device_time_zone: String,
}

impl SyncEngine {
  pub fn new(
    queue: Arc<dyn TaskQueue>,
    online: watch::Receiver<bool>,
    device_time_zone: String,
  ) -> Self {
    Self {
      queue,
      backends: OnceLock::new(),
      online,
      draining: AtomicBool::new(false),
      last_finished: Mutex::new(None),
      device_time_zone,
    }
  }

  /// Attach the remote clients. Only the first call has any effect.
  pub fn attach(&self, backends: Backends) {
    if self.backends.set(backends).is_err() {
      debug!("backends already attached");
    }
  }

  pub fn state(&self) -> SyncState {
    if self.draining.load(Ordering::Acquire) {
      SyncState::Draining
    } else {
      SyncState::Idle
    }
  }

  /// True if a drain completed less than `gap` ago.
  pub fn finished_within(&self, gap: Duration) -> bool {
    self
      .last_finished
      .lock()
      .ok()
      .and_then(|last| *last)
      .map(|at| at.elapsed() < gap)
      .unwrap_or(false)
  }

  /// Run one drain cycle over every queued task, oldest first.
  ///
  /// Never returns an error: per-task failures are logged and the task is
  /// retried on the next cycle.
  pub async fn drain(&self) -> DrainOutcome {
    let Some(_guard) = DrainGuard::acquire(&self.draining) else {
      debug!("drain already in progress, trigger ignored");
      return DrainOutcome::Skipped(SkipReason::AlreadyDraining);
    };

    if !*self.online.borrow() {
      debug!("offline, drain skipped");
      return DrainOutcome::Skipped(SkipReason::Offline);
    }

    let Some(backends) = self.backends.get() else {
      debug!("backends not attached, drain skipped");
      return DrainOutcome::Skipped(SkipReason::BackendsDetached);
    };

    let tasks = match self.queue.take_all() {
      Ok(tasks) => tasks,
      Err(e) => {
        warn!(error = %e, "could not read task queue");
        return DrainOutcome::Skipped(SkipReason::QueueUnavailable);
      }
    };

    let mut report = DrainReport::default();
    if !tasks.is_empty() {
      info!(pending = tasks.len(), "draining task queue");
    }

    for task in &tasks {
      let (Some(path), Some(scope)) = (&task.target_record_path, &task.scope) else {
        warn!(id = task.id, kind = %task.kind, "malformed task discarded");
        match self.queue.remove(task.id) {
          Ok(()) => report.discarded += 1,
          Err(e) => {
            warn!(id = task.id, error = %e, "failed to discard malformed task");
            report.failed += 1;
          }
        }
        continue;
      };

      match self.process_task(task, path, scope, backends).await {
        Ok(()) => {
          debug!(id = task.id, path = %path, "task synced");
          report.processed += 1;
        }
        Err(e) => {
          warn!(id = task.id, path = %path, error = %e, "task failed, retrying next cycle");
          report.failed += 1;
        }
      }
    }

    if let Ok(mut last) = self.last_finished.lock() {
      *last = Some(Instant::now());
    }

    if report != DrainReport::default() {
      info!(
        processed = report.processed,
        discarded = report.discarded,
        failed = report.failed,
        "drain finished"
      );
    }
    DrainOutcome::Completed(report)
  }

  async fn process_task(
    &self,
    task: &Task,
    path: &str,
    scope: &Scope,
    backends: &Backends,
  ) -> Result<()> {
    let folder = blob_folder(&task.kind);
    let stamp = Utc::now().timestamp_millis();
    let mut patch = RecordPatch::new();

    // Upload everything first; the record is only patched once every
    // payload has a hosted copy.
    for payload in &task.embedded_payloads {
      let decoded = DecodedPayload::parse(&payload.name, &payload.data)?;
      let blob_path = format!(
        "{}/{}/{}/{}_{}.{}",
        folder,
        scope.client,
        scope.unit,
        stamp,
        payload.name,
        decoded.extension()
      );

      backends
        .blobs
        .put(&blob_path, decoded.bytes, &decoded.content_type)
        .await
        .map_err(|e| eyre!("Failed to upload {}: {}", blob_path, e))?;
      let url = backends
        .blobs
        .download_url(&blob_path)
        .await
        .map_err(|e| eyre!("Failed to resolve {}: {}", blob_path, e))?;

      patch.set(payload.hosted_field(), Value::String(url));
      patch.delete(payload.embedded_field());
    }

    if !patch.is_empty() {
      patch.stamp_reconnection(&Local::now().to_rfc3339(), &self.device_time_zone);
      backends
        .documents
        .merge_patch(path, &patch)
        .await
        .map_err(|e| eyre!("Failed to patch {}: {}", path, e))?;
    }

    self.queue.remove(task.id)
  }
}

/// Top-level blob folder for a task kind.
fn blob_folder(kind: &str) -> &'static str {
  let kind = kind.to_ascii_lowercase();
  if kind.contains("logbook") || kind.contains("cuaderno") {
    "logbook"
  } else {
    "incidents"
  }
}

/// Time zone name stamped on reconnected records.
pub fn device_time_zone(configured: Option<&str>) -> String {
  if let Some(tz) = configured.filter(|tz| !tz.is_empty()) {
    return tz.to_string();
  }
  if let Ok(tz) = std::env::var("TZ") {
    let tz = tz.trim_start_matches(':');
    if !tz.is_empty() {
      return tz.to_string();
    }
  }
  let offset = Local::now().offset().local_minus_utc();
  if offset == 0 {
    "UTC".to_string()
  } else {
    format!("UTC{}", Local::now().format("%:z"))
  }
}
