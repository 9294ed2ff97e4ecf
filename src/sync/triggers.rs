//! Drain trigger sources feeding one consumer loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::engine::SyncEngine;

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
  Startup,
  ConnectivityRestored,
  Foreground,
  /// Fallback timer for environments where connectivity events are unreliable
  Periodic,
  Manual,
}

/// Cloneable producer side of the drain loop.
#[derive(Clone)]
pub struct SyncHandle {
  tx: mpsc::UnboundedSender<DrainTrigger>,
}

impl SyncHandle {
  pub fn request(&self, trigger: DrainTrigger) {
    if self.tx.send(trigger).is_err() {
      debug!(?trigger, "drain loop stopped, trigger dropped");
    }
  }

  /// Manual "flush now" entry point.
  pub fn flush_now(&self) {
    self.request(DrainTrigger::Manual);
  }
}

/// Spawn the drain loop plus its startup and periodic producers.
///
/// Each trigger starts its own drain; the engine's single-flight guard
/// discards any that overlap a running cycle. A periodic tick is also
/// dropped when a drain finished within `min_gap`.
pub fn spawn_drain_loop(
  engine: Arc<SyncEngine>,
  periodic: Duration,
  min_gap: Duration,
) -> SyncHandle {
  let (tx, mut rx) = mpsc::unbounded_channel::<DrainTrigger>();

  tokio::spawn(async move {
    while let Some(trigger) = rx.recv().await {
      if trigger == DrainTrigger::Periodic && engine.finished_within(min_gap) {
        debug!("periodic drain skipped, ran recently");
        continue;
      }
      debug!(?trigger, "drain requested");
      let engine = Arc::clone(&engine);
      tokio::spawn(async move {
        engine.drain().await;
      });
    }
  });

  let ticker = tx.clone();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(periodic);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; startup has its own trigger.
    interval.tick().await;
    loop {
      interval.tick().await;
      if ticker.send(DrainTrigger::Periodic).is_err() {
        break;
      }
    }
  });

  let handle = SyncHandle { tx };
  handle.request(DrainTrigger::Startup);
  handle
}

/// Publish reachability of `probe_url` on `online` every `interval`.
///
/// An offline-to-online transition also requests a drain.
pub fn spawn_connectivity_probe(
  probe_url: String,
  interval: Duration,
  online: watch::Sender<bool>,
  handle: SyncHandle,
) {
  tokio::spawn(async move {
    let client = match reqwest::Client::builder().timeout(interval).build() {
      Ok(client) => client,
      Err(e) => {
        error!(error = %e, "connectivity probe disabled");
        return;
      }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let reachable = client.head(&probe_url).send().await.is_ok();
      let was_online = online.send_replace(reachable);

      if reachable && !was_online {
        info!("connectivity restored");
        handle.request(DrainTrigger::ConnectivityRestored);
      } else if !reachable && was_online {
        info!("connectivity lost");
      }

      if online.is_closed() {
        break;
      }
    }
  });
}
